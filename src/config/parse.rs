//! The config parser: a character-at-a-time state machine.
//!
//! Indentation rules: the first indented line fixes both the whitespace
//! character (tab or space, never both) and the character count per
//! level; every later line must be a whole multiple of that count and may
//! only go one level deeper at a time. Loadable entry titles must start
//! in column zero. Quoted values accept any printable character,
//! including the ones that are structural elsewhere.

use alloc::vec::Vec;

use super::{Config, ConfigEntry, ConfigError, EntryKind, ValueData};

const DEPTH_CAPACITY: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Key,
    Value,
    LoadableEntryTitle,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseDepth {
    Unknown,
    Zero,
    NonZero,
}

struct ParseState<'src> {
    src: &'src str,

    file_line: usize,
    line_offset: usize,
    global_offset: usize,

    state: State,

    // Character picked as whitespace for this file, 0 until known.
    whitespace_character: u8,
    current_whitespace_depth: usize,

    // Number of characters per indentation level, 0 until known.
    characters_per_level: usize,

    // Set when whitespace has been seen after a value: any further
    // non-whitespace character on the line is invalid.
    expecting_end_of_value: bool,

    consumed_at_least_one: bool,

    bd: BaseDepth,

    // Character used by the current value for quoting, 0 for none.
    open_quote_character: u8,

    value_start: usize,
    value_len: usize,
    key_start: usize,
    key_len: usize,

    within_loadable_entry: bool,
    expecting_depth_plus_one: bool,

    // Empty loadable entries are not allowed.
    consumed_at_least_one_kv: bool,

    current_depth: usize,

    // Depth -> (offset + 1) of the last entry emplaced at that depth,
    // used to link together values of the same scope. 0 means none.
    depth_to_offset: [u32; DEPTH_CAPACITY],
}

impl<'src> ParseState<'src> {
    fn error(&self, message: &'static str) -> ConfigError {
        ConfigError {
            message,
            line: self.file_line,
            offset: self.line_offset,
            global_offset: self.global_offset,
        }
    }

    fn set_state(&mut self, new: State) {
        match new {
            State::Normal => {
                if self.state == State::LoadableEntryTitle {
                    self.within_loadable_entry = true;

                    for slot in self.depth_to_offset[1..].iter_mut() {
                        *slot = 0;
                    }
                    self.current_depth = 0;
                }

                self.expecting_end_of_value = false;
                self.consumed_at_least_one = false;
                self.open_quote_character = 0;
            }
            State::Key => {
                self.consumed_at_least_one = false;
                self.expecting_depth_plus_one = true;
            }
            State::Value => {
                self.expecting_depth_plus_one = false;
                self.consumed_at_least_one = false;
                self.expecting_end_of_value = false;
                self.open_quote_character = 0;
            }
            State::LoadableEntryTitle => {
                self.consumed_at_least_one = false;
                self.consumed_at_least_one_kv = false;
            }
            State::Comment => {}
        }

        self.state = new;
    }

    fn consume_character(&mut self, at: usize) {
        if self.consumed_at_least_one {
            self.value_len += 1;
        } else {
            self.value_start = at;
            self.value_len = 1;
            self.consumed_at_least_one = true;
        }
    }

    fn value_view(&self) -> &'src str {
        if !self.consumed_at_least_one {
            return "";
        }

        &self.src[self.value_start..self.value_start + self.value_len]
    }

    fn key_view(&self) -> &'src str {
        &self.src[self.key_start..self.key_start + self.key_len]
    }

    /// The scope-chain slot the current line's entry belongs to.
    fn slot(&self) -> usize {
        let base = usize::from(self.within_loadable_entry && self.bd == BaseDepth::NonZero);
        self.current_depth.saturating_sub(base)
    }

    fn do_depth_transition(&mut self) -> bool {
        if self.characters_per_level == 0 {
            // No level established means no indentation on this line; an
            // open object cannot possibly get its depth + 1 child.
            return !(self.expecting_depth_plus_one && self.current_whitespace_depth == 0);
        }

        // Unaligned to whitespace per level
        if self.current_whitespace_depth % self.characters_per_level != 0 {
            return false;
        }

        let next_depth = self.current_whitespace_depth / self.characters_per_level;
        let base = usize::from(self.within_loadable_entry && self.bd == BaseDepth::NonZero);

        // Cannot leave the loadable entry's base indentation
        if next_depth < base {
            return false;
        }

        if self.expecting_depth_plus_one {
            // Empty object
            if next_depth != self.current_depth + 1 {
                return false;
            }
        } else if next_depth > self.current_depth {
            // Went too deep
            return false;
        }

        /*
         * If our depth is now less than what it was before, close all
         * nested objects that are still open.
         */
        while self.current_depth > next_depth {
            let slot = self.slot();
            self.depth_to_offset[slot] = 0;
            self.current_depth -= 1;
        }

        self.current_depth = next_depth;
        true
    }

    fn value_from_state(&self) -> ValueData<'src> {
        let view = self.value_view();

        // Value is stored inside "" or '', force a string type.
        if self.open_quote_character != 0 {
            return ValueData::String(view);
        }

        match view {
            "null" => return ValueData::None,
            "true" => return ValueData::Bool(true),
            "false" => return ValueData::Bool(false),
            _ => {}
        }

        if let Some(number) = try_parse_as_number(view) {
            return number;
        }

        // Nothing else worked, assume string.
        ValueData::String(view)
    }

    fn finalize_key_value(
        &mut self,
        buffer: &mut Vec<ConfigEntry<'src>>,
        is_object: bool,
    ) -> Result<(), ConfigError> {
        let value = if is_object {
            ValueData::Object
        } else {
            self.value_from_state()
        };

        let entry_offset = buffer.len();
        buffer.push(ConfigEntry {
            key: self.key_view(),
            kind: EntryKind::Value,
            value,
            next_within_same_scope: 0,
            next_loadable_entry: 0,
        });

        let slot = self.slot();
        let prev = self.depth_to_offset[slot] as usize;

        if prev != 0 {
            buffer[prev - 1].next_within_same_scope = entry_offset - (prev - 1);
        }

        self.depth_to_offset[slot] = (entry_offset + 1) as u32;
        self.consumed_at_least_one_kv = true;

        Ok(())
    }
}

fn parse_u64(text: &str) -> Option<u64> {
    let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };

    if digits.is_empty() {
        return None;
    }

    u64::from_str_radix(digits, radix).ok()
}

fn try_parse_as_number(text: &str) -> Option<ValueData<'static>> {
    if let Some(rest) = text.strip_prefix('-') {
        let magnitude = parse_u64(rest)?;

        if magnitude > i64::MAX as u64 + 1 {
            return None;
        }

        return Some(ValueData::Signed((magnitude as i64).wrapping_neg()));
    }

    Some(ValueData::Unsigned(parse_u64(text)?))
}

pub(super) fn parse(text: &str) -> Result<Config<'_>, ConfigError> {
    let mut buffer: Vec<ConfigEntry<'_>> = Vec::new();
    let mut first_loadable_entry_offset = 0usize;
    let mut last_loadable_entry_offset = 0usize;

    let mut s = ParseState {
        src: text,
        file_line: 1,
        line_offset: 0,
        global_offset: 0,
        state: State::Normal,
        whitespace_character: 0,
        current_whitespace_depth: 0,
        characters_per_level: 0,
        expecting_end_of_value: false,
        consumed_at_least_one: false,
        bd: BaseDepth::Unknown,
        open_quote_character: 0,
        value_start: 0,
        value_len: 0,
        key_start: 0,
        key_len: 0,
        within_loadable_entry: false,
        expecting_depth_plus_one: false,
        consumed_at_least_one_kv: false,
        current_depth: 0,
        depth_to_offset: [0; DEPTH_CAPACITY],
    };

    for (i, c) in text.bytes().enumerate() {
        s.line_offset += 1;
        s.global_offset += 1;

        if s.state == State::Comment && c != b'\n' {
            continue;
        }

        match c {
            b' ' | b'\t' => {
                if s.state == State::Normal {
                    if s.whitespace_character != 0 && s.whitespace_character != c {
                        return Err(s.error("mixed tabs and spaces are ambiguous"));
                    }

                    s.whitespace_character = c;
                    s.current_whitespace_depth += 1;
                    continue;
                }

                if s.state == State::Key {
                    s.expecting_end_of_value = s.consumed_at_least_one;
                    continue;
                }

                if s.state == State::Value {
                    if s.open_quote_character == 0 {
                        s.expecting_end_of_value = s.consumed_at_least_one;
                        continue;
                    }

                    s.consume_character(i);
                    continue;
                }

                if s.expecting_end_of_value {
                    continue;
                }

                return Err(s.error("invalid character"));
            }

            b'\r' => {
                if s.state == State::Normal || s.state == State::Value {
                    continue;
                }

                return Err(s.error("invalid character"));
            }

            b'\n' => {
                s.file_line += 1;
                s.line_offset = 0;

                if s.characters_per_level == 0 {
                    s.whitespace_character = 0;
                }

                s.current_whitespace_depth = 0;
                s.expecting_end_of_value = false;

                match s.state {
                    State::Normal => continue,
                    State::Value => {
                        s.finalize_key_value(&mut buffer, false)?;
                        s.set_state(State::Normal);
                        continue;
                    }
                    State::Comment => {
                        s.set_state(State::Normal);
                        continue;
                    }
                    _ => return Err(s.error("invalid character")),
                }
            }

            b'=' => {
                if s.state == State::Normal
                    || (s.state == State::Value && s.open_quote_character == 0)
                {
                    return Err(s.error("invalid character"));
                }

                if s.state == State::Key {
                    s.set_state(State::Value);
                    continue;
                }

                s.consume_character(i);
            }

            b':' => {
                if s.state == State::Normal {
                    return Err(s.error("invalid character"));
                }

                if s.state == State::Key {
                    s.finalize_key_value(&mut buffer, true)?;
                    s.set_state(State::Normal);
                    s.expecting_end_of_value = true;
                    continue;
                }

                if s.state == State::Value && s.open_quote_character == 0 {
                    return Err(s.error("invalid character"));
                }

                s.consume_character(i);
            }

            b'"' | b'\'' => {
                if s.state != State::Value
                    || (s.open_quote_character == 0 && s.consumed_at_least_one)
                {
                    return Err(s.error("invalid character"));
                }

                if s.open_quote_character != 0 {
                    if s.open_quote_character != c {
                        s.consume_character(i);
                        continue;
                    }

                    s.finalize_key_value(&mut buffer, false)?;
                    s.set_state(State::Normal);
                    s.expecting_end_of_value = true;
                    continue;
                }

                s.open_quote_character = c;

                // An empty quoted string still counts as a value.
                s.value_start = i + 1;
                s.value_len = 0;
            }

            b'[' => {
                if s.state == State::Value && s.open_quote_character != 0 {
                    s.consume_character(i);
                    continue;
                }

                if s.state == State::Normal {
                    if s.current_whitespace_depth != 0 {
                        return Err(s.error("loadable entry title must start on a new line"));
                    }

                    if s.expecting_depth_plus_one {
                        return Err(s.error("empty objects are not allowed"));
                    }

                    if s.within_loadable_entry && !s.consumed_at_least_one_kv {
                        return Err(s.error("empty loadable entries are not allowed"));
                    }

                    s.set_state(State::LoadableEntryTitle);
                    continue;
                }

                return Err(s.error("invalid character"));
            }

            b']' => {
                if s.state == State::LoadableEntryTitle {
                    let offset = buffer.len();
                    buffer.push(ConfigEntry {
                        key: s.value_view(),
                        kind: EntryKind::LoadableEntry,
                        value: ValueData::None,
                        next_within_same_scope: 0,
                        next_loadable_entry: 0,
                    });

                    if first_loadable_entry_offset == 0 {
                        first_loadable_entry_offset = offset + 1;
                    }

                    if last_loadable_entry_offset != 0 {
                        let prev = last_loadable_entry_offset - 1;
                        buffer[prev].next_loadable_entry = offset - prev;
                    }
                    last_loadable_entry_offset = offset + 1;

                    // Thread the title into the top-level chain so scope
                    // walks can terminate on it.
                    let prev = s.depth_to_offset[0] as usize;
                    if prev != 0 {
                        buffer[prev - 1].next_within_same_scope = offset - (prev - 1);
                    }
                    s.depth_to_offset[0] = (offset + 1) as u32;

                    s.bd = BaseDepth::Unknown;
                    s.set_state(State::Normal);
                    s.expecting_end_of_value = true;
                    continue;
                }

                if s.state == State::Value && s.open_quote_character != 0 {
                    s.consume_character(i);
                    continue;
                }

                return Err(s.error("invalid character"));
            }

            b'#' => {
                if s.state == State::Key || s.state == State::LoadableEntryTitle {
                    return Err(s.error("invalid character"));
                }

                if s.state == State::Value && s.open_quote_character != 0 {
                    s.consume_character(i);
                    continue;
                }

                if s.state == State::Value {
                    // Comment terminates the value like a newline would.
                    s.finalize_key_value(&mut buffer, false)?;
                    s.set_state(State::Normal);
                }

                s.expecting_end_of_value = false;
                s.set_state(State::Comment);
            }

            _ => {
                if c <= 32 || c >= 127 {
                    return Err(s.error("invalid character"));
                }

                if s.expecting_end_of_value {
                    return Err(s.error("unexpected character"));
                }

                match s.state {
                    State::Normal => {
                        if s.current_whitespace_depth != 0 && s.characters_per_level == 0 {
                            s.characters_per_level = s.current_whitespace_depth;
                        }

                        if s.bd == BaseDepth::Unknown && s.within_loadable_entry {
                            if s.current_whitespace_depth != 0 {
                                s.bd = BaseDepth::NonZero;

                                // The base indentation is this entry's
                                // depth zero.
                                s.current_depth = 1;
                            } else {
                                s.bd = BaseDepth::Zero;
                            }
                        }

                        if !s.do_depth_transition() {
                            return Err(s.error("invalid number of whitespace"));
                        }

                        s.set_state(State::Key);
                        s.key_start = i;
                        s.key_len = 1;
                        s.consumed_at_least_one = true;
                    }
                    State::Key => s.key_len += 1,
                    State::Value | State::LoadableEntryTitle => s.consume_character(i),
                    _ => return Err(s.error("invalid character")),
                }
            }
        }
    }

    // EOF handling.
    if s.state == State::Value {
        s.finalize_key_value(&mut buffer, false)?;
    } else {
        if s.expecting_depth_plus_one
            || (s.within_loadable_entry && !s.consumed_at_least_one_kv)
        {
            return Err(s.error("early EOF"));
        }

        if s.state != State::Normal && s.state != State::Comment {
            return Err(s.error("early EOF"));
        }
    }

    Ok(Config {
        buffer,
        first_loadable_entry_offset,
        last_loadable_entry_offset,
    })
}
