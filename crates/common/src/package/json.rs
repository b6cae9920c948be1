//! Incremental JSON syntax check
//!
//! [`JsonCheck`] accepts exactly the documents `serde_json::from_slice`
//! parses into a `Value`, one chunk at a time, without keeping the
//! document. It also tracks whether the top-level object has a string
//! `resourceType` member. UTF-8 validity of string contents is left to
//! the caller.

/// Nesting at which `serde_json` stops with a recursion error
const MAX_DEPTH: usize = 127;
const RESOURCE_TYPE: &[u8] = b"resourceType";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Key,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Text {
    Plain,
    Escape,
    Hex { digits: u8, code: u32, high: Option<u32> },
    /// A high surrogate was decoded, a `\u` low surrogate must follow
    LowBackslash { high: u32 },
    LowU { high: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Number {
    Minus,
    Zero,
    Int,
    Dot,
    Frac,
    Exp,
    ExpSign,
    ExpDigits,
}

impl Number {
    fn complete(self) -> bool {
        matches!(self, Number::Zero | Number::Int | Number::Frac | Number::ExpDigits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Value,
    ArrayStart,
    ObjectStart,
    Key,
    Colon,
    AfterValue,
    String(Role, Text),
    Literal(&'static [u8]),
    Number(Number),
    Done,
}

pub(crate) struct JsonCheck {
    state: State,
    stack: Vec<Container>,
    /// Decoded text of the current top-level key, cut off once it is
    /// longer than any key of interest
    key: Vec<u8>,
    member_is_resource_type: bool,
    has_resource_type: bool,
    number: String,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn hex(b: u8) -> Option<u32> {
    (b as char).to_digit(16)
}

impl JsonCheck {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Value,
            stack: Vec::new(),
            key: Vec::new(),
            member_is_resource_type: false,
            has_resource_type: false,
            number: String::new(),
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<(), String> {
        chunk.iter().try_for_each(|b| self.step(*b))
    }

    /// End of input; returns whether the top-level value is an object whose
    /// last `resourceType` member is a string
    pub(crate) fn finish(&mut self) -> Result<bool, String> {
        if let State::Number(n) = self.state {
            if !n.complete() {
                return Err("EOF while parsing a number".into());
            }
            self.end_number()?;
        }
        match self.state {
            State::Done => Ok(self.has_resource_type),
            _ => Err("EOF while parsing a value".into()),
        }
    }

    fn step(&mut self, b: u8) -> Result<(), String> {
        match self.state {
            State::Value | State::ArrayStart if is_space(b) => Ok(()),
            State::ArrayStart if b == b']' => self.close(Container::Array),
            State::Value | State::ArrayStart => self.begin_value(b),
            State::ObjectStart | State::Key | State::Colon | State::AfterValue | State::Done
                if is_space(b) =>
            {
                Ok(())
            }
            State::ObjectStart if b == b'}' => self.close(Container::Object),
            State::ObjectStart | State::Key if b == b'"' => {
                self.key.clear();
                self.state = State::String(Role::Key, Text::Plain);
                Ok(())
            }
            State::ObjectStart | State::Key => Err("key must be a string".into()),
            State::Colon if b == b':' => {
                self.state = State::Value;
                Ok(())
            }
            State::Colon => Err("expected `:`".into()),
            State::AfterValue => match (b, self.stack.last()) {
                (b',', Some(Container::Object)) => {
                    self.state = State::Key;
                    Ok(())
                }
                (b',', Some(Container::Array)) => {
                    self.state = State::Value;
                    Ok(())
                }
                (b'}', _) => self.close(Container::Object),
                (b']', _) => self.close(Container::Array),
                _ => Err("expected `,` or end of container".into()),
            },
            State::Done => Err("trailing characters".into()),
            State::String(role, text) => self.string(role, text, b),
            State::Literal(rest) => match rest.split_first() {
                Some((expected, rest)) if *expected == b => {
                    if rest.is_empty() {
                        self.end_value();
                    } else {
                        self.state = State::Literal(rest);
                    }
                    Ok(())
                }
                _ => Err("expected ident".into()),
            },
            State::Number(n) => self.number(n, b),
        }
    }

    fn begin_value(&mut self, b: u8) -> Result<(), String> {
        if std::mem::take(&mut self.member_is_resource_type) {
            self.has_resource_type = b == b'"';
        }
        let state = match b {
            b'{' => return self.open(Container::Object),
            b'[' => return self.open(Container::Array),
            b'"' => State::String(Role::Value, Text::Plain),
            b't' => State::Literal(b"rue"),
            b'f' => State::Literal(b"alse"),
            b'n' => State::Literal(b"ull"),
            b'-' => {
                self.number.clear();
                self.number.push('-');
                State::Number(Number::Minus)
            }
            b'0'..=b'9' => {
                self.number.clear();
                self.number.push(b as char);
                State::Number(if b == b'0' { Number::Zero } else { Number::Int })
            }
            _ => return Err("expected value".into()),
        };
        self.state = state;
        Ok(())
    }

    fn open(&mut self, container: Container) -> Result<(), String> {
        if self.stack.len() >= MAX_DEPTH {
            return Err("recursion limit exceeded".into());
        }
        self.stack.push(container);
        self.state = match container {
            Container::Object => State::ObjectStart,
            Container::Array => State::ArrayStart,
        };
        Ok(())
    }

    fn close(&mut self, container: Container) -> Result<(), String> {
        if self.stack.pop() != Some(container) {
            return Err("mismatched closing delimiter".into());
        }
        self.end_value();
        Ok(())
    }

    fn end_value(&mut self) {
        self.state = if self.stack.is_empty() {
            State::Done
        } else {
            State::AfterValue
        };
    }

    fn collecting_key(&self, role: Role) -> bool {
        role == Role::Key && self.stack.len() == 1
    }

    fn push_key(&mut self, bytes: &[u8]) {
        if self.key.len() <= RESOURCE_TYPE.len() {
            self.key.extend_from_slice(bytes);
        }
    }

    fn push_key_char(&mut self, code: u32) -> Result<(), String> {
        let c = char::from_u32(code).ok_or("invalid unicode code point")?;
        let mut buf = [0u8; 4];
        self.push_key(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }

    fn string(&mut self, role: Role, text: Text, b: u8) -> Result<(), String> {
        let collect = self.collecting_key(role);
        let next = match text {
            Text::Plain => match b {
                b'"' => {
                    match role {
                        Role::Key => {
                            self.member_is_resource_type = collect && self.key == RESOURCE_TYPE;
                            self.state = State::Colon;
                        }
                        Role::Value => self.end_value(),
                    }
                    return Ok(());
                }
                b'\\' => Text::Escape,
                0x00..=0x1f => return Err("control character while parsing a string".into()),
                _ => {
                    if collect {
                        self.push_key(&[b]);
                    }
                    Text::Plain
                }
            },
            Text::Escape => {
                let decoded = match b {
                    b'"' | b'\\' | b'/' => b,
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'u' => {
                        self.state = State::String(
                            role,
                            Text::Hex {
                                digits: 0,
                                code: 0,
                                high: None,
                            },
                        );
                        return Ok(());
                    }
                    _ => return Err("invalid escape".into()),
                };
                if collect {
                    self.push_key(&[decoded]);
                }
                Text::Plain
            }
            Text::Hex { digits, code, high } => {
                let code = code * 16 + hex(b).ok_or("invalid escape")?;
                if digits < 3 {
                    Text::Hex {
                        digits: digits + 1,
                        code,
                        high,
                    }
                } else {
                    match (high, code) {
                        (Some(high), 0xdc00..=0xdfff) => {
                            if collect {
                                self.push_key_char(0x10000 + ((high - 0xd800) << 10) + (code - 0xdc00))?;
                            }
                            Text::Plain
                        }
                        (Some(_), _) => return Err("lone leading surrogate in hex escape".into()),
                        (None, 0xd800..=0xdbff) => Text::LowBackslash { high: code },
                        (None, 0xdc00..=0xdfff) => {
                            return Err("lone trailing surrogate in hex escape".into())
                        }
                        (None, _) => {
                            if collect {
                                self.push_key_char(code)?;
                            }
                            Text::Plain
                        }
                    }
                }
            }
            Text::LowBackslash { high } if b == b'\\' => Text::LowU { high },
            Text::LowU { high } if b == b'u' => Text::Hex {
                digits: 0,
                code: 0,
                high: Some(high),
            },
            Text::LowBackslash { .. } | Text::LowU { .. } => {
                return Err("lone leading surrogate in hex escape".into())
            }
        };
        self.state = State::String(role, next);
        Ok(())
    }

    fn number(&mut self, n: Number, b: u8) -> Result<(), String> {
        let next = match (n, b) {
            (Number::Minus, b'0') => Number::Zero,
            (Number::Minus, b'1'..=b'9') => Number::Int,
            (Number::Minus, _) => return Err("invalid number".into()),
            (Number::Int, b'0'..=b'9') => Number::Int,
            (Number::Zero | Number::Int, b'.') => Number::Dot,
            (Number::Dot | Number::Frac, b'0'..=b'9') => Number::Frac,
            (Number::Dot, _) => return Err("invalid number".into()),
            (Number::Zero | Number::Int | Number::Frac, b'e' | b'E') => Number::Exp,
            (Number::Exp, b'+' | b'-') => Number::ExpSign,
            (Number::Exp | Number::ExpSign | Number::ExpDigits, b'0'..=b'9') => Number::ExpDigits,
            (Number::Exp | Number::ExpSign, _) => return Err("invalid number".into()),
            _ => {
                // the byte belongs to whatever follows the number
                self.end_number()?;
                return self.step(b);
            }
        };
        self.number.push(b as char);
        self.state = State::Number(next);
        Ok(())
    }

    fn end_number(&mut self) -> Result<(), String> {
        match self.number.parse::<f64>() {
            Ok(v) if v.is_finite() => {
                self.end_value();
                Ok(())
            }
            _ => Err("number out of range".into()),
        }
    }
}
