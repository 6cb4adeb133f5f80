use crate::error::{Error, Result};
use crate::rbytes::{RBuffer, WBuffer};
use crate::streamer::{ElementKind, Record, StreamerRegistry, Value};

/// Version written in front of container members of a record.
const VECTOR_VERSION: i16 = 9;

/// read_record decodes an object of class `class` using the layout matching
/// the version found in the stream.
pub fn read_record(r: &mut RBuffer, reg: &StreamerRegistry, class: &str) -> Result<Record> {
    let hdr = r.read_version()?;
    let info = reg.lookup(class, hdr.version)?;

    let mut rec = Record::new(class, hdr.version);
    for field in &info.fields {
        let v = match &field.kind {
            ElementKind::Counted { count, .. } => {
                let n = count_of(&rec, count)?;
                let _is_array = r.read_u8()?;
                read_value(r, reg, &field.kind, Some(n))?
            }
            ElementKind::Vector(_) => {
                let vhdr = r.read_version()?;
                let v = read_value(r, reg, &field.kind, None)?;
                r.check_byte_count(&vhdr, "vector")?;
                v
            }
            kind => read_value(r, reg, kind, None)?,
        };
        rec.fields.push((field.name.clone(), v));
    }

    r.check_byte_count(&hdr, class)?;
    Ok(rec)
}

/// write_record encodes rec with the layout registered for its class and version.
pub fn write_record(w: &mut WBuffer, reg: &StreamerRegistry, rec: &Record) -> Result<()> {
    let info = reg.get(&rec.class, rec.version).ok_or_else(|| Error::SchemaNotFound {
        class: rec.class.clone(),
        version: rec.version,
    })?;

    let pos = w.write_version(info.version);
    for field in &info.fields {
        let v = rec.get(&field.name).ok_or_else(|| {
            Error::binding(format!(
                "record {:?} has no field {:?}",
                rec.class, field.name
            ))
        })?;
        match &field.kind {
            ElementKind::Counted { count, .. } => {
                let n = count_of(rec, count)?;
                w.write_u8(1);
                write_value(w, reg, &field.kind, v, Some(n))?;
            }
            ElementKind::Vector(_) => {
                let vpos = w.write_version(VECTOR_VERSION);
                write_value(w, reg, &field.kind, v, None)?;
                w.set_byte_count(vpos);
            }
            kind => write_value(w, reg, kind, v, None)?,
        }
    }
    w.set_byte_count(pos);
    Ok(())
}

fn count_of(rec: &Record, count: &str) -> Result<usize> {
    let v = rec.get(count).ok_or_else(|| {
        Error::corrupted(format!(
            "count field {:?} of {:?} is not decoded before its array",
            count, rec.class
        ))
    })?;
    match v.as_i64() {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(Error::corrupted(format!(
            "invalid count {} in field {:?} of {:?}",
            v, count, rec.class
        ))),
    }
}

/// read_value decodes one element of the given kind. Counted arrays take their
/// length from `count`.
pub fn read_value(
    r: &mut RBuffer,
    reg: &StreamerRegistry,
    kind: &ElementKind,
    count: Option<usize>,
) -> Result<Value> {
    let v = match kind {
        ElementKind::Basic(t) => t.read(r)?,
        ElementKind::FixedArray { elem, dims } => {
            let n = ElementKind::check_dims(dims)?;
            read_basic_array(r, *elem, n)?
        }
        ElementKind::Counted { elem, count: name } => {
            let n = count.ok_or_else(|| {
                Error::corrupted(format!("no count available for array counted by {:?}", name))
            })?;
            read_basic_array(r, *elem, n)?
        }
        ElementKind::String => Value::Str(r.read_string()?),
        ElementKind::Record { class } => Value::Record(read_record(r, reg, class)?),
        ElementKind::Vector(elem) => {
            let n = r.read_i32()?;
            if n < 0 {
                return Err(Error::corrupted(format!("negative vector length {}", n)));
            }
            let n = n as usize;
            if n > r.remaining() {
                return Err(Error::ShortBuffer {
                    offset: r.pos(),
                    need: n,
                    available: r.remaining(),
                });
            }
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_value(r, reg, elem, None)?);
            }
            Value::Array(items)
        }
    };
    Ok(v)
}

fn read_basic_array(r: &mut RBuffer, elem: crate::streamer::BasicType, n: usize) -> Result<Value> {
    let need = n.checked_mul(elem.size()).unwrap_or(usize::MAX);
    if need > r.remaining() {
        return Err(Error::ShortBuffer {
            offset: r.pos(),
            need,
            available: r.remaining(),
        });
    }
    let mut items = Vec::with_capacity(n);
    for _ in 0..n {
        items.push(elem.read(r)?);
    }
    Ok(Value::Array(items))
}

/// write_value encodes one element. The value must match the kind exactly.
pub fn write_value(
    w: &mut WBuffer,
    reg: &StreamerRegistry,
    kind: &ElementKind,
    v: &Value,
    count: Option<usize>,
) -> Result<()> {
    match (kind, v) {
        (ElementKind::Basic(t), v) => t.write(w, v)?,
        (ElementKind::FixedArray { elem, dims }, Value::Array(items)) => {
            let n = ElementKind::array_len(dims)
                .ok_or_else(|| Error::binding(format!("invalid array dimensions {:?}", dims)))?;
            if items.len() != n {
                return Err(Error::binding(format!(
                    "array of {} elements written to {}",
                    items.len(),
                    kind
                )));
            }
            for item in items {
                elem.write(w, item)?;
            }
        }
        (ElementKind::Counted { elem, count: name }, Value::Array(items)) => {
            if let Some(n) = count {
                if items.len() != n {
                    return Err(Error::binding(format!(
                        "slice of {} elements does not match count {:?}={}",
                        items.len(),
                        name,
                        n
                    )));
                }
            }
            for item in items {
                elem.write(w, item)?;
            }
        }
        (ElementKind::String, Value::Str(s)) => w.write_string(s),
        (ElementKind::Record { class }, Value::Record(rec)) => {
            if &rec.class != class {
                return Err(Error::binding(format!(
                    "record of class {:?} written as {:?}",
                    rec.class, class
                )));
            }
            write_record(w, reg, rec)?
        }
        (ElementKind::Vector(elem), Value::Array(items)) => {
            w.write_i32(items.len() as i32);
            for item in items {
                write_value(w, reg, elem, item, None)?;
            }
        }
        (kind, v) => {
            return Err(Error::binding(format!(
                "cannot write {} value as {}",
                v.kind_name(),
                kind
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::streamer::{
        read_record, write_record, BasicType, ElementKind, FieldDesc, Record, StreamerInfo,
        StreamerRegistry, Value,
    };

    fn registry() -> StreamerRegistry {
        let reg = StreamerRegistry::new();
        reg.register(StreamerInfo::new(
            "P3",
            1,
            vec![
                FieldDesc::new("px", ElementKind::Basic(BasicType::I32)),
                FieldDesc::new("py", ElementKind::Basic(BasicType::F64)),
            ],
        ))
        .unwrap();
        reg.register(StreamerInfo::new(
            "Event",
            2,
            vec![
                FieldDesc::new("flag", ElementKind::Basic(BasicType::Bool)),
                FieldDesc::new("name", ElementKind::String),
                FieldDesc::new(
                    "mat",
                    ElementKind::FixedArray {
                        elem: BasicType::I16,
                        dims: vec![2, 2],
                    },
                ),
                FieldDesc::new("n", ElementKind::Basic(BasicType::U32)),
                FieldDesc::new(
                    "hits",
                    ElementKind::Counted {
                        elem: BasicType::F32,
                        count: "n".to_string(),
                    },
                ),
                FieldDesc::new(
                    "p3",
                    ElementKind::Record {
                        class: "P3".to_string(),
                    },
                ),
                FieldDesc::new(
                    "tags",
                    ElementKind::Vector(Box::new(ElementKind::String)),
                ),
            ],
        ))
        .unwrap();
        reg
    }

    fn event() -> Record {
        Record::new("Event", 2)
            .with("flag", Value::Bool(true))
            .with("name", Value::Str("evt-1".into()))
            .with(
                "mat",
                Value::Array(vec![
                    Value::I16(1),
                    Value::I16(2),
                    Value::I16(3),
                    Value::I16(4),
                ]),
            )
            .with("n", Value::U32(3))
            .with(
                "hits",
                Value::Array(vec![Value::F32(1.5), Value::F32(2.5), Value::F32(3.5)]),
            )
            .with(
                "p3",
                Value::Record(
                    Record::new("P3", 1)
                        .with("px", Value::I32(-7))
                        .with("py", Value::F64(0.25)),
                ),
            )
            .with(
                "tags",
                Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]),
            )
    }

    #[test]
    fn test_record_roundtrip() {
        let reg = registry();
        let rec = event();

        let mut w = WBuffer::new();
        write_record(&mut w, &reg, &rec).unwrap();
        let data = w.into_vec();

        let mut r = RBuffer::new(&data);
        let got = read_record(&mut r, &reg, "Event").unwrap();
        assert_eq!(got, rec);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_forward_compatible_decode() {
        let writer = registry();
        writer
            .register(StreamerInfo::new(
                "P3",
                2,
                vec![
                    FieldDesc::new("px", ElementKind::Basic(BasicType::I32)),
                    FieldDesc::new("py", ElementKind::Basic(BasicType::F64)),
                    FieldDesc::new("pz", ElementKind::Basic(BasicType::F64)),
                ],
            ))
            .unwrap();
        let rec = Record::new("P3", 2)
            .with("px", Value::I32(1))
            .with("py", Value::F64(2.0))
            .with("pz", Value::F64(3.0));

        let mut w = WBuffer::new();
        write_record(&mut w, &writer, &rec).unwrap();
        w.write_i32(99);
        let data = w.into_vec();

        // the reader only knows version 1: pz is skipped by byte count.
        let reader = registry();
        let mut r = RBuffer::new(&data);
        let got = read_record(&mut r, &reader, "P3").unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.fields.len(), 2);
        assert_eq!(got.get("py"), Some(&Value::F64(2.0)));
        assert_eq!(r.read_i32().unwrap(), 99);
    }

    #[test]
    fn test_write_mismatches() {
        let reg = registry();
        let mut rec = event();
        rec.set("n", Value::U32(2));
        assert!(write_record(&mut WBuffer::new(), &reg, &rec).is_err());

        let mut rec = event();
        rec.set("flag", Value::I32(1));
        assert!(write_record(&mut WBuffer::new(), &reg, &rec).is_err());

        let rec = Record::new("Unknown", 1);
        assert!(write_record(&mut WBuffer::new(), &reg, &rec).is_err());
    }

    #[test]
    fn test_truncated_record() {
        let reg = registry();
        let mut w = WBuffer::new();
        write_record(&mut w, &reg, &event()).unwrap();
        let data = w.into_vec();

        let mut r = RBuffer::new(&data[..data.len() - 3]);
        assert!(read_record(&mut r, &reg, "Event").is_err());
    }
}
