use std::fmt::{Display, Formatter};

/// Value is a decoded field, leaf entry or whole object of a class without a
/// built-in representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Array(Vec<Value>),
    Record(Record),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Record(_) => "record",
        }
    }

    /// as_i64 converts integer values, used to read counts.
    pub fn as_i64(&self) -> Option<i64> {
        let v = match self {
            Self::I8(v) => *v as i64,
            Self::I16(v) => *v as i64,
            Self::I32(v) => *v as i64,
            Self::I64(v) => *v,
            Self::U8(v) => *v as i64,
            Self::U16(v) => *v as i64,
            Self::U32(v) => *v as i64,
            Self::U64(v) => i64::try_from(*v).ok()?,
            _ => return None,
        };
        Some(v)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(*v as f64),
            Self::F64(v) => Some(*v),
            v => v.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Record(r) => write!(f, "{}", r),
        }
    }
}

/// Record is an object decoded through its class layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub class: String,
    pub version: i16,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(class: impl Into<String>, version: i16) -> Self {
        Self {
            class: class.into(),
            version,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, v: Value) -> Self {
        self.fields.push((name.into(), v));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// set replaces the named field, appending it when absent.
    pub fn set(&mut self, name: &str, v: Value) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = v,
            None => self.fields.push((name.to_string(), v)),
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, v)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use crate::streamer::{Record, Value};

    #[test]
    fn test_display() {
        assert_eq!(Value::F32(1.1).to_string(), "1.1");
        assert_eq!(Value::Str("uno".into()).to_string(), "uno");
        let arr = Value::Array(vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
        assert_eq!(arr.to_string(), "[1 2 3]");

        let rec = Record::new("P3", 1)
            .with("px", Value::I32(1))
            .with("name", Value::Str("p".into()));
        assert_eq!(Value::Record(rec).to_string(), "{px: 1, name: p}");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::U8(7).as_i64(), Some(7));
        assert_eq!(Value::U64(u64::MAX).as_i64(), None);
        assert_eq!(Value::F32(0.5).as_f64(), Some(0.5));
        assert_eq!(Value::Bool(true).as_i64(), None);

        let mut rec = Record::new("P", 1).with("x", Value::I32(1));
        rec.set("x", Value::I32(2));
        rec.set("y", Value::I32(3));
        assert_eq!(rec.get("x"), Some(&Value::I32(2)));
        assert_eq!(rec.fields.len(), 2);
    }
}
