use crate::stage::{Patch, StageBody, StageContext, StageFailure};
use crate::util::sha256_reader;
use serde_json::json;
use std::fs::File;

/// Content digest of the source file, used to spot duplicates and edits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumBody;

impl StageBody for ChecksumBody {
    fn process(&mut self, ctx: &StageContext<'_>) -> Result<Patch, StageFailure> {
        let mut file = File::open(ctx.key)
            .map_err(|err| StageFailure::recoverable(format!("open {}: {err}", ctx.key)))?;
        let (digest, size_bytes) = sha256_reader(&mut file)
            .map_err(|err| StageFailure::recoverable(format!("read {}: {err}", ctx.key)))?;
        Ok(Patch::section(
            "checksum",
            json!({
                "algorithm": "sha256",
                "digest": digest,
                "size_bytes": size_bytes,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn digests_file_contents() {
        let dir = tempfile::tempdir().expect("temp dir");
        let photo = dir.path().join("a.jpg");
        std::fs::write(&photo, b"abc").expect("write");
        let key = photo.display().to_string();
        let mut catalog = Catalog::empty(dir.path().join("master.json"));
        catalog.insert_key(&key).expect("insert");

        let patch = ChecksumBody
            .process(&StageContext {
                stage: "checksum",
                key: &key,
                entry: catalog.get(&key).expect("entry"),
            })
            .expect("checksum");
        let (_, value) = patch.iter().next().expect("section");
        assert_eq!(
            value["digest"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(value["size_bytes"], 3);
    }
}
