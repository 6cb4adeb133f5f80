use crate::error::{Error, Result};
use crate::rbytes::{RBuffer, WBuffer};
use crate::streamer::{read_value, write_value, BasicType, ElementKind, StreamerRegistry, Value};

const LEAF_VERSION: i16 = 2;

const KIND_BASIC: u8 = 0;
const KIND_FIXED_ARRAY: u8 = 1;
const KIND_COUNTED: u8 = 2;
const KIND_STRING: u8 = 3;
const KIND_RECORD: u8 = 4;
const KIND_VECTOR: u8 = 5;

/// Leaf describes the element type of a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub name: String,
    pub title: String,
    pub kind: ElementKind,
}

fn type_code(t: BasicType) -> char {
    match t {
        BasicType::Bool => 'O',
        BasicType::I8 => 'B',
        BasicType::U8 => 'b',
        BasicType::I16 => 'S',
        BasicType::U16 => 's',
        BasicType::I32 => 'I',
        BasicType::U32 => 'i',
        BasicType::I64 => 'L',
        BasicType::U64 => 'l',
        BasicType::F32 => 'F',
        BasicType::F64 => 'D',
    }
}

impl Leaf {
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        let name = name.into();
        let title = match &kind {
            ElementKind::Basic(t) => format!("{}/{}", name, type_code(*t)),
            ElementKind::FixedArray { elem, dims } => {
                let dims: String = dims.iter().map(|d| format!("[{}]", d)).collect();
                format!("{}{}/{}", name, dims, type_code(*elem))
            }
            ElementKind::Counted { elem, count } => {
                format!("{}[{}]/{}", name, count, type_code(*elem))
            }
            ElementKind::String => format!("{}/C", name),
            ElementKind::Record { .. } | ElementKind::Vector(_) => name.clone(),
        };
        Self { name, title, kind }
    }

    /// class is the leaf class name matching the element type.
    pub fn class(&self) -> &'static str {
        let t = match &self.kind {
            ElementKind::Basic(t) => *t,
            ElementKind::FixedArray { elem, .. } | ElementKind::Counted { elem, .. } => *elem,
            ElementKind::String => return "TLeafC",
            ElementKind::Record { .. } | ElementKind::Vector(_) => return "TLeafElement",
        };
        match t {
            BasicType::Bool => "TLeafO",
            BasicType::I8 | BasicType::U8 => "TLeafB",
            BasicType::I16 | BasicType::U16 => "TLeafS",
            BasicType::I32 | BasicType::U32 => "TLeafI",
            BasicType::I64 | BasicType::U64 => "TLeafL",
            BasicType::F32 => "TLeafF",
            BasicType::F64 => "TLeafD",
        }
    }

    /// count is the name of the leaf holding the length of a counted array.
    pub fn count(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Counted { count, .. } => Some(count),
            _ => None,
        }
    }

    /// entry_size is the encoded size of every entry of a fixed-size leaf.
    pub fn entry_size(&self) -> Option<usize> {
        match &self.kind {
            ElementKind::Basic(t) => Some(t.size()),
            ElementKind::FixedArray { elem, dims } => ElementKind::array_len(dims).map(|n| elem.size() * n),
            _ => None,
        }
    }

    /// decode decodes the bytes of one entry.
    pub fn decode(&self, data: &[u8], reg: &StreamerRegistry) -> Result<Value> {
        let mut r = RBuffer::new(data);
        let count = match &self.kind {
            ElementKind::Counted { elem, .. } => {
                if data.len() % elem.size() != 0 {
                    return Err(Error::corrupted(format!(
                        "leaf {:?}: {} bytes is not a whole number of {}",
                        self.name,
                        data.len(),
                        elem.type_name()
                    )));
                }
                Some(data.len() / elem.size())
            }
            _ => None,
        };
        let v = read_value(&mut r, reg, &self.kind, count)?;
        if r.remaining() != 0 {
            return Err(Error::corrupted(format!(
                "leaf {:?}: {} trailing bytes after entry",
                self.name,
                r.remaining()
            )));
        }
        Ok(v)
    }

    /// encode encodes one entry. Counted arrays are checked against count.
    pub fn encode(&self, v: &Value, count: Option<usize>, reg: &StreamerRegistry) -> Result<Vec<u8>> {
        let mut w = WBuffer::new();
        write_value(&mut w, reg, &self.kind, v, count)?;
        Ok(w.into_vec())
    }

    pub(crate) fn marshal(&self, w: &mut WBuffer) {
        let pos = w.write_version(LEAF_VERSION);
        w.write_tnamed(&self.name, &self.title);
        write_kind(w, &self.kind);
        w.set_byte_count(pos);
    }

    pub(crate) fn unmarshal(r: &mut RBuffer) -> Result<Self> {
        let hdr = r.read_version()?;
        let (name, title) = r.read_tnamed()?;
        let kind = read_kind(r)?;
        r.check_byte_count(&hdr, "TLeaf")?;
        Ok(Self { name, title, kind })
    }
}

fn write_kind(w: &mut WBuffer, kind: &ElementKind) {
    match kind {
        ElementKind::Basic(t) => {
            w.write_u8(KIND_BASIC);
            w.write_i32(t.code());
        }
        ElementKind::FixedArray { elem, dims } => {
            w.write_u8(KIND_FIXED_ARRAY);
            w.write_i32(elem.code());
            w.write_i32(dims.len() as i32);
            for d in dims {
                w.write_i32(*d as i32);
            }
        }
        ElementKind::Counted { elem, count } => {
            w.write_u8(KIND_COUNTED);
            w.write_i32(elem.code());
            w.write_string(count);
        }
        ElementKind::String => w.write_u8(KIND_STRING),
        ElementKind::Record { class } => {
            w.write_u8(KIND_RECORD);
            w.write_string(class);
        }
        ElementKind::Vector(elem) => {
            w.write_u8(KIND_VECTOR);
            write_kind(w, elem);
        }
    }
}

fn read_basic(r: &mut RBuffer) -> Result<BasicType> {
    let code = r.read_i32()?;
    BasicType::from_code(code).ok_or_else(|| Error::corrupted(format!("unknown leaf type code {}", code)))
}

fn read_kind(r: &mut RBuffer) -> Result<ElementKind> {
    let tag = r.read_u8()?;
    let kind = match tag {
        KIND_BASIC => ElementKind::Basic(read_basic(r)?),
        KIND_FIXED_ARRAY => {
            let elem = read_basic(r)?;
            let n = r.read_i32()?;
            if !(0..=8).contains(&n) {
                return Err(Error::corrupted(format!("invalid leaf array rank {}", n)));
            }
            let mut dims = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let d = r.read_i32()?;
                if d < 0 {
                    return Err(Error::corrupted(format!("invalid leaf array dimension {}", d)));
                }
                dims.push(d as usize);
            }
            ElementKind::check_dims(&dims)?;
            ElementKind::FixedArray { elem, dims }
        }
        KIND_COUNTED => {
            let elem = read_basic(r)?;
            ElementKind::Counted {
                elem,
                count: r.read_string()?,
            }
        }
        KIND_STRING => ElementKind::String,
        KIND_RECORD => ElementKind::Record {
            class: r.read_string()?,
        },
        KIND_VECTOR => ElementKind::Vector(Box::new(read_kind(r)?)),
        _ => return Err(Error::corrupted(format!("unknown leaf kind {}", tag))),
    };
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::rtree::Leaf;
    use crate::streamer::{BasicType, ElementKind, StreamerRegistry, Value};

    #[test]
    fn test_titles_and_classes() {
        let leaf = Leaf::new("one", ElementKind::Basic(BasicType::I32));
        assert_eq!(leaf.title, "one/I");
        assert_eq!(leaf.class(), "TLeafI");
        assert_eq!(leaf.entry_size(), Some(4));

        let leaf = Leaf::new(
            "arr",
            ElementKind::FixedArray {
                elem: BasicType::F32,
                dims: vec![2, 3],
            },
        );
        assert_eq!(leaf.title, "arr[2][3]/F");
        assert_eq!(leaf.entry_size(), Some(24));

        let leaf = Leaf::new(
            "F32s",
            ElementKind::Counted {
                elem: BasicType::F32,
                count: "N".to_string(),
            },
        );
        assert_eq!(leaf.title, "F32s[N]/F");
        assert_eq!(leaf.count(), Some("N"));
        assert_eq!(leaf.entry_size(), None);
        assert_eq!(Leaf::new("three", ElementKind::String).class(), "TLeafC");
    }

    #[test]
    fn test_entry_codec() {
        let reg = StreamerRegistry::new();
        let leaf = Leaf::new(
            "xs",
            ElementKind::Counted {
                elem: BasicType::I16,
                count: "n".to_string(),
            },
        );
        let v = Value::Array(vec![Value::I16(1), Value::I16(-2), Value::I16(3)]);
        let data = leaf.encode(&v, Some(3), &reg).unwrap();
        assert_eq!(data.len(), 6);
        assert_eq!(leaf.decode(&data, &reg).unwrap(), v);
        assert!(leaf.encode(&v, Some(2), &reg).is_err());
        assert!(leaf.decode(&data[..5], &reg).is_err());

        let leaf = Leaf::new("s", ElementKind::String);
        let data = leaf.encode(&Value::Str("tres".into()), None, &reg).unwrap();
        assert_eq!(leaf.decode(&data, &reg).unwrap(), Value::Str("tres".into()));

        let mut padded = data.clone();
        padded.push(0);
        assert!(leaf.decode(&padded, &reg).is_err());
    }

    #[test]
    fn test_marshal() {
        let leaf = Leaf::new(
            "hits",
            ElementKind::Vector(Box::new(ElementKind::Basic(BasicType::F32))),
        );
        let mut w = WBuffer::new();
        leaf.marshal(&mut w);
        let got = Leaf::unmarshal(&mut RBuffer::new(w.as_slice())).unwrap();
        assert_eq!(got, leaf);
    }

    #[test]
    fn test_unmarshal_oversized_array() {
        let leaf = Leaf::new(
            "big",
            ElementKind::FixedArray {
                elem: BasicType::I32,
                dims: vec![i32::MAX as usize; 3],
            },
        );
        assert_eq!(leaf.entry_size(), None);
        let mut w = WBuffer::new();
        leaf.marshal(&mut w);
        match Leaf::unmarshal(&mut RBuffer::new(w.as_slice())) {
            Err(Error::Corrupted(msg)) => assert!(msg.contains("invalid array dimensions"), "{}", msg),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
