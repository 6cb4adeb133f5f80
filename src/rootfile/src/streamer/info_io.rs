//! Wire form of class layouts: a `TStreamerInfo` holding a `TObjArray` of
//! `TStreamerElement` subclasses.

use crate::error::{Error, Result};
use crate::rbytes::{ClassTag, RBuffer, WBuffer};
use crate::streamer::{codes, BasicType, ElementKind, FieldDesc, StreamerInfo};

const STREAMER_INFO_VERSION: i16 = 9;
const OBJ_ARRAY_VERSION: i16 = 3;
const ELEMENT_VERSION: i16 = 4;
const BASIC_TYPE_VERSION: i16 = 2;
const BASIC_POINTER_VERSION: i16 = 2;
const STRING_VERSION: i16 = 2;
const OBJECT_ANY_VERSION: i16 = 2;
const STL_VERSION: i16 = 3;

const MAX_DIMS: usize = 5;

/// write_streamer_info writes the body of a `TStreamerInfo` object.
pub fn write_streamer_info(w: &mut WBuffer, info: &StreamerInfo) -> Result<()> {
    let pos = w.write_version(STREAMER_INFO_VERSION);
    w.write_tnamed(&info.class, "");
    w.write_u32(info.checksum);
    w.write_i32(info.version as i32);

    let arr = w.write_class_tag("TObjArray");
    let arr_body = w.write_version(OBJ_ARRAY_VERSION);
    w.write_tobject();
    w.write_string("");
    w.write_i32(info.fields.len() as i32);
    w.write_i32(0);
    for field in &info.fields {
        write_element(w, field)?;
    }
    w.set_byte_count(arr_body);
    w.set_byte_count(arr);

    w.set_byte_count(pos);
    Ok(())
}

/// read_streamer_info reads the body of a `TStreamerInfo` object.
pub fn read_streamer_info(r: &mut RBuffer) -> Result<StreamerInfo> {
    let hdr = r.read_version()?;
    let (class, _) = r.read_tnamed()?;
    let checksum = r.read_u32()?;
    let version = r.read_i32()?;
    let version = i16::try_from(version)
        .map_err(|_| Error::corrupted(format!("class version {} of {:?} out of range", version, class)))?;

    let mut fields = Vec::new();
    match r.read_class_tag()? {
        ClassTag::Null => {}
        ClassTag::Class { name, end } if name == "TObjArray" => {
            let arr = r.read_version()?;
            r.read_tobject()?;
            let _name = r.read_string()?;
            let n = r.read_i32()?;
            let _lower_bound = r.read_i32()?;
            for _ in 0..n.max(0) {
                if let Some(field) = read_element(r)? {
                    fields.push(field);
                }
            }
            r.check_byte_count(&arr, "TObjArray")?;
            if let Some(end) = end {
                r.set_pos(end)?;
            }
        }
        ClassTag::Class { name, .. } => {
            return Err(Error::corrupted(format!(
                "streamer of {:?} holds its elements in a {}",
                class, name
            )))
        }
    }

    r.check_byte_count(&hdr, "TStreamerInfo")?;
    Ok(StreamerInfo {
        class,
        version,
        checksum,
        fields,
    })
}

struct ElementHeader {
    etype: i32,
    size: i32,
    arr_len: i32,
    dims: Vec<usize>,
    type_name: String,
}

fn element_class(kind: &ElementKind) -> (&'static str, i16) {
    match kind {
        ElementKind::Basic(_) | ElementKind::FixedArray { .. } => {
            ("TStreamerBasicType", BASIC_TYPE_VERSION)
        }
        ElementKind::Counted { .. } => ("TStreamerBasicPointer", BASIC_POINTER_VERSION),
        ElementKind::String => ("TStreamerString", STRING_VERSION),
        ElementKind::Record { .. } => ("TStreamerObjectAny", OBJECT_ANY_VERSION),
        ElementKind::Vector(_) => ("TStreamerSTL", STL_VERSION),
    }
}

fn element_header(kind: &ElementKind) -> Result<ElementHeader> {
    let (etype, size, arr_len, dims) = match kind {
        ElementKind::Basic(t) => (t.code(), t.size() as i32, 0, vec![]),
        ElementKind::FixedArray { elem, dims } => {
            let n = ElementKind::array_len(dims)
                .ok_or_else(|| Error::binding(format!("invalid array dimensions {:?}", dims)))?
                as i32;
            (
                codes::OFFSET_L + elem.code(),
                elem.size() as i32 * n,
                n,
                dims.clone(),
            )
        }
        ElementKind::Counted { elem, .. } => {
            (codes::OFFSET_P + elem.code(), elem.size() as i32, 0, vec![])
        }
        ElementKind::String => (codes::TSTRING, 24, 0, vec![]),
        ElementKind::Record { .. } => (codes::ANY, 0, 0, vec![]),
        ElementKind::Vector(_) => (codes::STL, 24, 0, vec![]),
    };
    Ok(ElementHeader {
        etype,
        size,
        arr_len,
        dims,
        type_name: kind.type_name(),
    })
}

fn write_element(w: &mut WBuffer, field: &FieldDesc) -> Result<()> {
    let (class, version) = element_class(&field.kind);
    let hdr = element_header(&field.kind)?;
    if hdr.dims.len() > MAX_DIMS {
        return Err(Error::binding(format!(
            "field {:?} has {} dimensions, at most {} are supported",
            field.name,
            hdr.dims.len(),
            MAX_DIMS
        )));
    }

    let tag = w.write_class_tag(class);
    let pos = w.write_version(version);

    let base = w.write_version(ELEMENT_VERSION);
    let title = match &field.kind {
        ElementKind::Counted { count, .. } => format!("[{}]", count),
        _ => String::new(),
    };
    w.write_tnamed(&field.name, &title);
    w.write_i32(hdr.etype);
    w.write_i32(hdr.size);
    w.write_i32(hdr.arr_len);
    w.write_i32(hdr.dims.len() as i32);
    for i in 0..MAX_DIMS {
        w.write_i32(hdr.dims.get(i).copied().unwrap_or(0) as i32);
    }
    w.write_string(&hdr.type_name);
    w.set_byte_count(base);

    match &field.kind {
        ElementKind::Counted { count, .. } => {
            w.write_i32(1);
            w.write_string(count);
            w.write_string("");
        }
        ElementKind::Vector(elem) => {
            w.write_i32(codes::STL_VECTOR);
            let ctype = match elem.as_ref() {
                ElementKind::Basic(t) => t.code(),
                ElementKind::String => codes::STL_STRING,
                _ => codes::OBJECT,
            };
            w.write_i32(ctype);
        }
        _ => {}
    }

    w.set_byte_count(pos);
    w.set_byte_count(tag);
    Ok(())
}

/// read_element decodes one streamer element. Elements of unknown classes are
/// skipped and yield None.
fn read_element(r: &mut RBuffer) -> Result<Option<FieldDesc>> {
    let (class, end) = match r.read_class_tag()? {
        ClassTag::Null => return Ok(None),
        ClassTag::Class { name, end } => (name, end),
    };

    let known = matches!(
        class.as_str(),
        "TStreamerBasicType"
            | "TStreamerBasicPointer"
            | "TStreamerString"
            | "TStreamerObjectAny"
            | "TStreamerObject"
            | "TStreamerSTL"
            | "TStreamerSTLstring"
    );
    if !known {
        let end = end.ok_or_else(|| {
            Error::corrupted(format!("cannot skip streamer element {} without byte count", class))
        })?;
        tracing::debug!("skipping streamer element of class {}", class);
        r.set_pos(end)?;
        return Ok(None);
    }

    let hdr = r.read_version()?;
    let base = r.read_version()?;
    let (name, title) = r.read_tnamed()?;
    let etype = r.read_i32()?;
    let _size = r.read_i32()?;
    let _arr_len = r.read_i32()?;
    let arr_dim = r.read_i32()?;
    let mut max_index = [0_i32; MAX_DIMS];
    for slot in max_index.iter_mut() {
        *slot = r.read_i32()?;
    }
    let type_name = r.read_string()?;
    r.check_byte_count(&base, "TStreamerElement")?;

    let kind = match etype {
        t if (1..=19).contains(&t) => ElementKind::Basic(basic(t, &name)?),
        t if t > codes::OFFSET_L && t < codes::OFFSET_P => {
            let mut dims = Vec::with_capacity(MAX_DIMS);
            for d in &max_index[..(arr_dim.clamp(0, MAX_DIMS as i32) as usize)] {
                if *d < 0 {
                    return Err(Error::corrupted(format!(
                        "invalid array dimension {} for member {:?}",
                        d, name
                    )));
                }
                dims.push(*d as usize);
            }
            ElementKind::check_dims(&dims)?;
            ElementKind::FixedArray {
                elem: basic(t - codes::OFFSET_L, &name)?,
                dims,
            }
        }
        t if t > codes::OFFSET_P && t < codes::OFFSET_P + 20 => {
            let elem = basic(t - codes::OFFSET_P, &name)?;
            let _count_version = r.read_i32()?;
            let count = r.read_string()?;
            let _count_class = r.read_string()?;
            let count = if count.is_empty() {
                title.trim_start_matches('[').trim_end_matches(']').to_string()
            } else {
                count
            };
            ElementKind::Counted { elem, count }
        }
        codes::TSTRING | codes::STL_STRING => ElementKind::String,
        codes::OBJECT | codes::ANY | codes::OBJECT_P | codes::OBJECT_PP | codes::ANY_P => {
            ElementKind::Record { class: type_name }
        }
        codes::STL | codes::STREAMER => {
            let _stl_type = r.read_i32()?;
            let _ctype = r.read_i32()?;
            ElementKind::from_type_name(&type_name)
        }
        t => {
            return Err(Error::corrupted(format!(
                "unsupported element type {} for member {:?}",
                t, name
            )))
        }
    };

    r.check_byte_count(&hdr, &class)?;
    if let Some(end) = end {
        r.set_pos(end)?;
    }
    Ok(Some(FieldDesc::new(name, kind)))
}

fn basic(code: i32, name: &str) -> Result<BasicType> {
    BasicType::from_code(code).ok_or_else(|| {
        Error::corrupted(format!("unsupported basic type {} for member {:?}", code, name))
    })
}
