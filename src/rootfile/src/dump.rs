//! Human readable listing of the content of a file.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;

use crate::error::Result;
use crate::riofs::{Directory, File};
use crate::rtree::{Reader, Tree};
use crate::streamer::Record;

/// dump writes one line per key of file, `key[000]: name;cycle "title" (class)`.
/// With deep, directories are listed recursively, records are printed after
/// their key and every entry of a tree is printed leaf by leaf.
pub async fn dump<W: Write + Send>(w: &mut W, file: &File, deep: bool) -> Result<()> {
    dump_dir(w, &file.root(), "", deep).await
}

fn dump_dir<'a, W: Write + Send>(
    w: &'a mut W,
    dir: &'a Directory,
    prefix: &'a str,
    deep: bool,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        for (i, key) in dir.keys().into_iter().enumerate() {
            write!(
                w,
                "key[{:03}]: {}{};{} {:?} ({})",
                i,
                prefix,
                key.name(),
                key.cycle(),
                key.title(),
                key.class()
            )?;
            if !deep {
                writeln!(w)?;
                continue;
            }

            if key.is_directory() {
                writeln!(w)?;
                let sub = dir.get_dir(&format!("{};{}", key.name(), key.cycle())).await?;
                let prefix = format!("{}{}/", prefix, key.name());
                dump_dir(w, &sub, &prefix, deep).await?;
            } else if key.class() == "TTree" {
                writeln!(w)?;
                let tree = dir.get_tree(&format!("{};{}", key.name(), key.cycle())).await?;
                dump_tree(w, &tree).await?;
            } else {
                let obj = key.object().await?;
                match obj.as_any().downcast_ref::<Record>() {
                    Some(rec) => writeln!(w, " => {}", rec)?,
                    None => writeln!(w)?,
                }
            }
        }
        Ok(())
    })
}

/// dump_tree writes `[entry][leaf]: value` for every leaf of every entry.
async fn dump_tree<W: Write + Send>(w: &mut W, tree: &Tree) -> Result<()> {
    let mut r = Reader::new(tree, vec![], vec![])?;
    r.read(|ctx| {
        for v in ctx.vars() {
            writeln!(w, "[{:03}][{}]: {}", ctx.entry(), v.name(), v.value())?;
        }
        Ok(())
    })
    .await?;
    r.close().await
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::dump::dump;
    use crate::riofs::File;
    use crate::rtree::{Slot, WriteOption, WriteVar, Writer};
    use crate::streamer::{BasicType, ElementKind, FieldDesc, Record, StreamerInfo, Value};

    #[tokio::test]
    async fn test_dump() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.root");

        let f = File::create(&path).await.unwrap();
        let one = Slot::new(0_i32);
        let two = Slot::new(0_f64);
        let three = Slot::new(String::new());
        let arr = Slot::new([0_u8; 3]);
        let vars = vec![
            WriteVar::new("one", &one).unwrap(),
            WriteVar::new("two", &two).unwrap(),
            WriteVar::new("three", &three).unwrap(),
            WriteVar::new("arr", &arr).unwrap(),
        ];
        let mut w = Writer::new(&f.root(), "tree", vars, vec![WriteOption::with_title("fake data")]).unwrap();
        for (i, s) in ["uno", "dos"].iter().enumerate() {
            one.set(i as i32 + 1);
            two.set((i as f64 + 1.0) * 1.5);
            three.set(s.to_string());
            arr.set([i as u8, 2, 3]);
            w.write().await.unwrap();
        }
        w.close().await.unwrap();

        f.register_streamer(StreamerInfo::new(
            "Point",
            1,
            vec![FieldDesc::new("x", ElementKind::Basic(BasicType::I16))],
        ))
        .unwrap();
        let sub = f.root().mkdir("sub").await.unwrap();
        sub.put_with_title("p", "a point", &Record::new("Point", 1).with("x", Value::I16(7)))
            .await
            .unwrap();
        f.close().await.unwrap();

        let f = File::open(&path).await.unwrap();
        let mut out = Vec::new();
        dump(&mut out, &f, false).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "key[000]: tree;1 \"fake data\" (TTree)\nkey[001]: sub;1 \"\" (TDirectory)\n"
        );

        let mut out = Vec::new();
        dump(&mut out, &f, true).await.unwrap();
        let want = [
            "key[000]: tree;1 \"fake data\" (TTree)",
            "[000][one]: 1",
            "[000][two]: 1.5",
            "[000][three]: uno",
            "[000][arr]: [0 2 3]",
            "[001][one]: 2",
            "[001][two]: 3",
            "[001][three]: dos",
            "[001][arr]: [1 2 3]",
            "key[001]: sub;1 \"\" (TDirectory)",
            "key[000]: sub/p;1 \"a point\" (Point) => {x: 7}",
            "",
        ]
        .join("\n");
        assert_eq!(String::from_utf8(out).unwrap(), want);
        f.close().await.unwrap();
    }
}
