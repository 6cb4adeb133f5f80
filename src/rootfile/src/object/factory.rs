use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::object::{List, ObjArray, Object};
use crate::rbytes::{ClassTag, RBuffer, WBuffer};
use crate::riofs::{DirRecord, KeyHeader};
use crate::rtree::{BasketHeader, BranchRecord, TreeRecord};
use crate::streamer::{read_record, read_streamer_info, StreamerRegistry};

/// DecodeFn decodes the body of an object whose class is already known.
pub type DecodeFn = fn(&mut RBuffer, &StreamerRegistry, &Factory) -> Result<Box<dyn Object>>;

/// Factory maps class names to decoders. Classes without a registered decoder
/// are decoded generically through their streamer into a `Record`.
pub struct Factory {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl Default for Factory {
    fn default() -> Self {
        Self::new()
    }
}

impl Factory {
    /// new creates a factory knowing the built-in classes.
    pub fn new() -> Self {
        let factory = Self {
            decoders: RwLock::new(HashMap::new()),
        };

        factory.register("TList", |r, reg, f| Ok(Box::new(List::unmarshal(r, reg, f)?)));
        factory.register("TObjArray", |r, reg, f| {
            Ok(Box::new(ObjArray::unmarshal(r, reg, f)?))
        });
        factory.register("TStreamerInfo", |r, _, _| Ok(Box::new(read_streamer_info(r)?)));
        factory.register("TKey", |r, _, _| Ok(Box::new(KeyHeader::unmarshal(r)?)));
        factory.register("TDirectory", |r, _, _| Ok(Box::new(DirRecord::unmarshal(r)?)));
        factory.register("TDirectoryFile", |r, _, _| Ok(Box::new(DirRecord::unmarshal(r)?)));
        factory.register("TBasket", |r, _, _| Ok(Box::new(BasketHeader::unmarshal(r)?)));
        factory.register("TTree", |r, _, _| Ok(Box::new(TreeRecord::unmarshal(r)?)));
        factory.register("TBranch", |r, _, _| Ok(Box::new(BranchRecord::unmarshal(r)?)));

        factory
    }

    pub fn register(&self, class: &str, f: DecodeFn) {
        self.decoders.write().insert(class.to_string(), f);
    }

    pub fn is_builtin(&self, class: &str) -> bool {
        self.decoders.read().contains_key(class)
    }

    /// decode decodes an object of the given class from r.
    pub fn decode(&self, class: &str, r: &mut RBuffer, reg: &StreamerRegistry) -> Result<Box<dyn Object>> {
        let decoder = self.decoders.read().get(class).copied();
        match decoder {
            Some(f) => f(r, reg, self),
            None => Ok(Box::new(read_record(r, reg, class)?)),
        }
    }

    /// read_object_any decodes an object streamed by pointer: a class tag
    /// followed by the object body. A null pointer yields None.
    pub fn read_object_any(&self, r: &mut RBuffer, reg: &StreamerRegistry) -> Result<Option<Box<dyn Object>>> {
        let (class, end) = match r.read_class_tag()? {
            ClassTag::Null => return Ok(None),
            ClassTag::Class { name, end } => (name, end),
        };

        let obj = self.decode(&class, r, reg)?;
        if let Some(end) = end {
            if r.pos() > end {
                return Err(Error::corrupted(format!(
                    "{} object overran its byte count by {} bytes",
                    class,
                    r.pos() - end
                )));
            }
            r.set_pos(end)?;
        }
        Ok(Some(obj))
    }

    /// write_object_any writes obj behind a class tag.
    pub fn write_object_any(w: &mut WBuffer, reg: &StreamerRegistry, obj: &dyn Object) -> Result<()> {
        let pos = w.write_class_tag(obj.class());
        obj.marshal(w, reg)?;
        w.set_byte_count(pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::object::{downcast, Factory, List, ObjArray, Object};
    use crate::rbytes::{RBuffer, WBuffer};
    use crate::streamer::{
        BasicType, ElementKind, FieldDesc, Record, StreamerInfo, StreamerRegistry, Value,
    };

    fn registry() -> StreamerRegistry {
        let reg = StreamerRegistry::new();
        reg.register(StreamerInfo::new(
            "P2",
            1,
            vec![
                FieldDesc::new("x", ElementKind::Basic(BasicType::F32)),
                FieldDesc::new("y", ElementKind::Basic(BasicType::F32)),
            ],
        ))
        .unwrap();
        reg
    }

    fn p2(x: f32, y: f32) -> Record {
        Record::new("P2", 1)
            .with("x", Value::F32(x))
            .with("y", Value::F32(y))
    }

    #[test]
    fn test_generic_decode() {
        let reg = registry();
        let factory = Factory::new();
        assert!(!factory.is_builtin("P2"));

        let mut w = WBuffer::new();
        p2(1.0, 2.0).marshal(&mut w, &reg).unwrap();
        let data = w.into_vec();

        let obj = factory.decode("P2", &mut RBuffer::new(&data), &reg).unwrap();
        assert_eq!(obj.class(), "P2");
        let rec: Record = downcast(obj, "p").unwrap();
        assert_eq!(rec, p2(1.0, 2.0));

        let err = factory
            .decode("Unknown", &mut RBuffer::new(&data), &reg)
            .unwrap_err();
        assert!(err.to_string().contains("Unknown"), "{}", err);
    }

    #[test]
    fn test_list_roundtrip() {
        let reg = registry();
        let factory = Factory::new();

        let info = reg.get("P2", 1).unwrap();
        let list = List::new(vec![
            Box::new(p2(1.0, 2.0)),
            Box::new((*info).clone()),
            Box::new(p2(3.0, 4.0)),
        ]);

        let mut w = WBuffer::with_origin(60);
        Factory::write_object_any(&mut w, &reg, &list).unwrap();
        let data = w.into_vec();

        let mut r = RBuffer::with_origin(&data, 60);
        let obj = factory.read_object_any(&mut r, &reg).unwrap().unwrap();
        let got: List = downcast(obj, "list").unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got.objects[0].class(), "P2");
        assert_eq!(got.objects[1].class(), "TStreamerInfo");
        let second: &Record = got.objects[2].as_any().downcast_ref().unwrap();
        assert_eq!(second, &p2(3.0, 4.0));
        assert_eq!(r.remaining(), 0);

        let obj = factory.read_object_any(&mut r, &reg);
        assert!(obj.is_err());
    }

    #[test]
    fn test_obj_array_keeps_empty_slots() {
        let reg = registry();
        let factory = Factory::new();
        let arr = ObjArray {
            name: "arr".to_string(),
            lower_bound: 0,
            objects: vec![Some(Box::new(p2(1.0, 1.0))), None],
        };

        let mut w = WBuffer::new();
        arr.marshal(&mut w, &reg).unwrap();
        let data = w.into_vec();

        let obj = factory.decode("TObjArray", &mut RBuffer::new(&data), &reg).unwrap();
        let got: ObjArray = downcast(obj, "arr").unwrap();
        assert_eq!(got.name, "arr");
        assert!(got.objects[0].is_some());
        assert!(got.objects[1].is_none());

        let obj = factory.decode("TObjArray", &mut RBuffer::new(&data), &reg).unwrap();
        assert!(downcast::<List>(obj, "arr").is_err());
    }

    #[test]
    fn test_oversized_collection_counts() {
        let reg = registry();
        let factory = Factory::new();
        for (class, version) in [("TList", 5), ("TObjArray", 3)] {
            let mut w = WBuffer::new();
            let pos = w.write_version(version);
            w.write_tobject();
            w.write_string("huge");
            w.write_i32(i32::MAX);
            w.write_i32(0);
            w.set_byte_count(pos);
            let data = w.into_vec();

            match factory.decode(class, &mut RBuffer::new(&data), &reg) {
                Ok(obj) => panic!("{}: decoded a {}", class, obj.class()),
                Err(e) => assert!(e.is_short_buffer(), "{}: {}", class, e),
            }
        }
    }
}
