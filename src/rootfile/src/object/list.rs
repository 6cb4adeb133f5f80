use std::any::Any;

use crate::error::Result;
use crate::object::{Factory, Object};
use crate::rbytes::{RBuffer, WBuffer};
use crate::streamer::StreamerRegistry;

const LIST_VERSION: i16 = 5;
const OBJ_ARRAY_VERSION: i16 = 3;

/// List is a named sequence of heterogeneous objects (`TList`).
#[derive(Debug, Default)]
pub struct List {
    pub name: String,
    pub objects: Vec<Box<dyn Object>>,
}

impl List {
    pub fn new(objects: Vec<Box<dyn Object>>) -> Self {
        Self {
            name: String::new(),
            objects,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub(crate) fn unmarshal(r: &mut RBuffer, reg: &StreamerRegistry, factory: &Factory) -> Result<Self> {
        let hdr = r.read_version()?;
        r.read_tobject()?;
        let name = r.read_string()?;
        let n = r.read_i32()?;

        let mut objects = Vec::with_capacity((n.max(0) as usize).min(r.remaining() / 4));
        for _ in 0..n.max(0) {
            if let Some(obj) = factory.read_object_any(r, reg)? {
                objects.push(obj);
            }
            let _option = r.read_string()?;
        }
        r.check_byte_count(&hdr, "TList")?;

        Ok(Self { name, objects })
    }
}

impl Object for List {
    fn class(&self) -> &str {
        "TList"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, reg: &StreamerRegistry) -> Result<()> {
        let pos = w.write_version(LIST_VERSION);
        w.write_tobject();
        w.write_string(&self.name);
        w.write_i32(self.objects.len() as i32);
        for obj in &self.objects {
            Factory::write_object_any(w, reg, obj.as_ref())?;
            w.write_string("");
        }
        w.set_byte_count(pos);
        Ok(())
    }
}

/// ObjArray is an indexed sequence of objects (`TObjArray`); empty slots are kept.
#[derive(Debug, Default)]
pub struct ObjArray {
    pub name: String,
    pub lower_bound: i32,
    pub objects: Vec<Option<Box<dyn Object>>>,
}

impl ObjArray {
    pub(crate) fn unmarshal(r: &mut RBuffer, reg: &StreamerRegistry, factory: &Factory) -> Result<Self> {
        let hdr = r.read_version()?;
        r.read_tobject()?;
        let name = r.read_string()?;
        let n = r.read_i32()?;
        let lower_bound = r.read_i32()?;

        let mut objects = Vec::with_capacity((n.max(0) as usize).min(r.remaining() / 4));
        for _ in 0..n.max(0) {
            objects.push(factory.read_object_any(r, reg)?);
        }
        r.check_byte_count(&hdr, "TObjArray")?;

        Ok(Self {
            name,
            lower_bound,
            objects,
        })
    }
}

impl Object for ObjArray {
    fn class(&self) -> &str {
        "TObjArray"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn marshal(&self, w: &mut WBuffer, reg: &StreamerRegistry) -> Result<()> {
        let pos = w.write_version(OBJ_ARRAY_VERSION);
        w.write_tobject();
        w.write_string(&self.name);
        w.write_i32(self.objects.len() as i32);
        w.write_i32(self.lower_bound);
        for obj in &self.objects {
            match obj {
                Some(obj) => Factory::write_object_any(w, reg, obj.as_ref())?,
                None => w.write_null_object(),
            }
        }
        w.set_byte_count(pos);
        Ok(())
    }
}
