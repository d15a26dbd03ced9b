//! Shared test utilities: scratch directories, generated inputs, and
//! in-process collaborators that need no host tooling.

#![allow(dead_code)]

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use pioneer_imager::build::{BuildOptions, BuildRequest, Builder, Toolset};
use pioneer_imager::disk::{FilesystemRegion, FilesystemWriter, PartitionTable, PartitionTableWriter};
use pioneer_imager::overlay::OverlayEntry;
use pioneer_imager::profile::IMAGE_HEADER_SIZE;
use pioneer_imager::sparse::NativeCodec;
use pioneer_imager::Result;

/// Records every table script instead of running sfdisk.
#[derive(Clone, Default)]
pub struct ScriptTable {
    pub scripts: Arc<Mutex<Vec<String>>>,
}

impl PartitionTableWriter for ScriptTable {
    fn write_table(&self, _image: &Path, table: &PartitionTable) -> Result<()> {
        self.scripts.lock().unwrap().push(table.sfdisk_script());
        Ok(())
    }
}

/// Writes a JSON listing of the entries at the start of the region
/// instead of running mke2fs.
#[derive(Clone, Default)]
pub struct JsonFilesystem {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FilesystemWriter for JsonFilesystem {
    fn populate(&self, image: &Path, region: &FilesystemRegion<'_>, entries: &[&OverlayEntry]) -> Result<()> {
        let listing: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| serde_json::json!({ "path": e.path, "len": e.content.len() }))
            .collect();
        let bytes = serde_json::to_vec(&listing).unwrap();
        assert!(bytes.len() as u64 <= region.size);

        let file = OpenOptions::new().write(true).open(image).unwrap();
        file.write_all_at(&bytes, region.offset).unwrap();
        self.calls.lock().unwrap().push(region.partition.to_string());
        Ok(())
    }
}

/// Scratch working directory plus the fakes a build was given.
pub struct TestEnv {
    /// Kept alive for the lifetime of the env.
    pub _temp_dir: TempDir,
    pub dir: PathBuf,
    pub table: ScriptTable,
    pub filesystem: JsonFilesystem,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        Self {
            _temp_dir: temp_dir,
            dir,
            table: ScriptTable::default(),
            filesystem: JsonFilesystem::default(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn builder(&self, options: BuildOptions) -> Builder {
        let tools = Toolset {
            table: Box::new(self.table.clone()),
            filesystem: Box::new(self.filesystem.clone()),
            codec: Box::new(NativeCodec),
        };
        Builder::new(
            tools,
            BuildOptions {
                check_host: false,
                ..options
            },
        )
    }

    pub fn request(&self, generation: &str, output: &str) -> BuildRequest {
        BuildRequest {
            generation: generation.into(),
            variant: 1,
            payload: self.path("update.zip"),
            extra_data: self.path("extdata.tar"),
            cache: self.path("cache.tar"),
            output: self.path(output),
        }
    }

    /// Names of everything in the working directory, sorted.
    pub fn listing(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// A vendor image: `header_fill` repeated over the header, then `content`.
pub fn prg(header_fill: u8, content: &[u8]) -> Vec<u8> {
    let mut bytes = vec![header_fill; IMAGE_HEADER_SIZE as usize];
    bytes.extend_from_slice(content);
    bytes
}

pub fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(*name, options).unwrap();
        std::io::Write::write_all(&mut zip, bytes).unwrap();
    }
    zip.finish().unwrap();
}

pub fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1_600_000_000);
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn write_tar(path: &Path, files: &[(&str, &str)]) {
    fs::write(path, tar_bytes(files)).unwrap();
}

pub fn write_tar_zst(path: &Path, files: &[(&str, &str)]) {
    let compressed = zstd::encode_all(&tar_bytes(files)[..], 3).unwrap();
    fs::write(path, compressed).unwrap();
}

pub fn read_at(path: &Path, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    File::open(path).unwrap().read_exact_at(&mut buf, offset).unwrap();
    buf
}

/// The JSON listing [`JsonFilesystem`] left at `offset`.
pub fn listing_at(path: &Path, offset: u64) -> serde_json::Value {
    let raw = read_at(path, offset, 4096);
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    serde_json::from_slice(&raw[..end]).unwrap()
}
