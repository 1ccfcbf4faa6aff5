//! Sharded safetensors checkpoint reader.

use memmap2::Mmap;
use safetensors::SafeTensors;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConvertError, Result};
use crate::tensor::{LazyTensor, SourceDtype, SourceTensor};

const INDEX_FILE: &str = "model.safetensors.index.json";

/// Locate the weight shards of a model directory, in sorted file-name order.
///
/// The `weight_map` of `model.safetensors.index.json` wins when present;
/// otherwise every `model*.safetensors` file in the directory is a shard.
pub fn find_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join(INDEX_FILE);
    let shards: BTreeSet<PathBuf> = if index_path.exists() {
        let raw = fs::read(&index_path).map_err(|e| ConvertError::io(&index_path, e))?;
        let idx: Value = serde_json::from_slice(&raw)?;
        let map = idx.get("weight_map").and_then(Value::as_object).ok_or_else(|| {
            ConvertError::CorruptShard {
                path: index_path.clone(),
                reason: "missing `weight_map` object".into(),
            }
        })?;
        map.values().filter_map(Value::as_str).map(|f| dir.join(f)).collect()
    } else {
        let mut found = BTreeSet::new();
        for entry in fs::read_dir(dir).map_err(|e| ConvertError::io(dir, e))? {
            let path = entry.map_err(|e| ConvertError::io(dir, e))?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with("model") && file_name.ends_with(".safetensors") {
                found.insert(path);
            }
        }
        found
    };

    if shards.is_empty() {
        return Err(ConvertError::NoShards(dir.to_path_buf()));
    }
    Ok(shards.into_iter().collect())
}

struct ShardEntry {
    name: String,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// One memory-mapped shard and its parsed header.
pub struct Shard {
    path: PathBuf,
    mmap: Arc<Mmap>,
    data_start: usize,
    entries: Vec<ShardEntry>,
}

impl Shard {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).map_err(|e| ConvertError::io(path, e))?;
        // SAFETY: shards are opened read-only and assumed immutable for the run.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| ConvertError::io(path, e))?;

        let (header_len, metadata) =
            SafeTensors::read_metadata(&mmap).map_err(|e| ConvertError::CorruptShard {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut entries: Vec<ShardEntry> = metadata
            .tensors()
            .into_iter()
            .map(|(name, info)| ShardEntry {
                name,
                dtype: info.dtype,
                shape: info.shape.clone(),
                start: info.data_offsets.0,
                end: info.data_offsets.1,
            })
            .collect();
        entries.sort_by_key(|e| (e.start, e.end));

        Ok(Self { path: path.to_path_buf(), mmap: Arc::new(mmap), data_start: 8 + header_len, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lazy handles for every tensor, in data-offset order.
    pub fn tensors(&self) -> Result<Vec<SourceTensor>> {
        self.entries
            .iter()
            .map(|entry| {
                let dtype = SourceDtype::from_safetensors(entry.dtype).ok_or_else(|| {
                    ConvertError::UnsupportedDtype {
                        name: entry.name.clone(),
                        dtype: format!("{:?}", entry.dtype),
                    }
                })?;
                let start = self.data_start + entry.start;
                let end = self.data_start + entry.end;
                if end > self.mmap.len() || start > end {
                    return Err(ConvertError::CorruptShard {
                        path: self.path.clone(),
                        reason: format!("tensor `{}` extends past end of file", entry.name),
                    });
                }
                let mmap = Arc::clone(&self.mmap);
                let lazy = LazyTensor::new(dtype, entry.shape.clone(), move || {
                    Ok(mmap[start..end].to_vec())
                });
                Ok(SourceTensor::new(entry.name.clone(), lazy))
            })
            .collect()
    }
}

/// All shards of one model directory.
pub struct Checkpoint {
    dir: PathBuf,
    shards: Vec<Shard>,
}

impl Checkpoint {
    pub fn open(dir: &Path) -> Result<Self> {
        let paths = find_shards(dir)?;
        let shards = paths.iter().map(|p| Shard::open(p)).collect::<Result<Vec<_>>>()?;
        info!(
            dir = %dir.display(),
            shards = shards.len(),
            tensors = shards.iter().map(Shard::len).sum::<usize>(),
            "opened checkpoint"
        );
        Ok(Self { dir: dir.to_path_buf(), shards })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Every source tensor, shard by shard, with cross-shard duplicates rejected.
    pub fn tensors(&self) -> Result<Vec<SourceTensor>> {
        let mut owner: HashMap<String, &Path> = HashMap::new();
        let mut out = Vec::new();
        for shard in &self.shards {
            debug!(shard = %shard.path().display(), tensors = shard.len(), "loading shard");
            for tensor in shard.tensors()? {
                if let Some(first) = owner.insert(tensor.name.clone(), shard.path()) {
                    return Err(ConvertError::DuplicateSourceTensor {
                        name: tensor.name,
                        first: first.to_path_buf(),
                        second: shard.path().to_path_buf(),
                    });
                }
                out.push(tensor);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use tempfile::TempDir;

    fn write_shard(path: &Path, tensors: &[(&str, Vec<usize>, Vec<f32>)]) {
        let bytes: Vec<Vec<u8>> =
            tensors.iter().map(|(_, _, v)| bytemuck::cast_slice(v).to_vec()).collect();
        let views: Vec<(String, TensorView<'_>)> = tensors
            .iter()
            .zip(&bytes)
            .map(|((name, shape, _), b)| {
                (name.to_string(), TensorView::new(safetensors::Dtype::F32, shape.clone(), b).unwrap())
            })
            .collect();
        safetensors::serialize_to_file(views, &None, path).unwrap();
    }

    #[test]
    fn directory_scan_only_takes_model_shards() {
        let dir = TempDir::new().unwrap();
        write_shard(&dir.path().join("model-00002-of-00002.safetensors"), &[("b", vec![1], vec![2.0])]);
        write_shard(&dir.path().join("model-00001-of-00002.safetensors"), &[("a", vec![1], vec![1.0])]);
        write_shard(&dir.path().join("adapter.safetensors"), &[("x", vec![1], vec![0.0])]);

        let shards = find_shards(dir.path()).unwrap();
        let names: Vec<_> =
            shards.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]);
    }

    #[test]
    fn index_weight_map_wins() {
        let dir = TempDir::new().unwrap();
        write_shard(&dir.path().join("weights-a.safetensors"), &[("a", vec![1], vec![1.0])]);
        write_shard(&dir.path().join("model.safetensors"), &[("z", vec![1], vec![1.0])]);
        fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"weight_map": {"a": "weights-a.safetensors", "a2": "weights-a.safetensors"}}"#,
        )
        .unwrap();
        let shards = find_shards(dir.path()).unwrap();
        assert_eq!(shards, vec![dir.path().join("weights-a.safetensors")]);
    }

    #[test]
    fn empty_directory_has_no_shards() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(find_shards(dir.path()), Err(ConvertError::NoShards(_))));
    }

    #[test]
    fn tensors_come_back_in_offset_order_and_decode() {
        let dir = TempDir::new().unwrap();
        write_shard(
            &dir.path().join("model.safetensors"),
            &[("zeta", vec![2], vec![1.0, 2.0]), ("alpha", vec![1, 3], vec![3.0, 4.0, 5.0])],
        );
        let ckpt = Checkpoint::open(dir.path()).unwrap();
        let tensors = ckpt.tensors().unwrap();
        assert_eq!(tensors.len(), 2);
        for t in &tensors {
            let m = t.tensor.materialize(&t.name).unwrap();
            match t.name.as_str() {
                "zeta" => assert_eq!(m.data, vec![1.0, 2.0]),
                "alpha" => {
                    assert_eq!(m.shape, vec![1, 3]);
                    assert_eq!(m.data, vec![3.0, 4.0, 5.0]);
                }
                other => panic!("unexpected tensor {other}"),
            }
        }
    }

    #[test]
    fn duplicate_names_across_shards_are_fatal() {
        let dir = TempDir::new().unwrap();
        write_shard(&dir.path().join("model-1.safetensors"), &[("w", vec![1], vec![1.0])]);
        write_shard(&dir.path().join("model-2.safetensors"), &[("w", vec![1], vec![2.0])]);
        let ckpt = Checkpoint::open(dir.path()).unwrap();
        assert!(matches!(
            ckpt.tensors(),
            Err(ConvertError::DuplicateSourceTensor { ref name, .. }) if name == "w"
        ));
    }
}
