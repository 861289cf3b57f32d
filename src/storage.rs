use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const FILES_DIR: &str = "files";
const BACKGROUNDS_AREA: &str = "backgrounds";
const CERTIFICATES_AREA: &str = "certificates";
const BUNDLES_AREA: &str = "bundles";
const PREVIEWS_AREA: &str = "previews";
const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT: &str = "attestd-certificates-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Replaced,
}

/// A background file written to disk but not yet referenced by its template.
#[derive(Debug, Clone)]
pub struct StagedBackground {
    pub filename: String,
    replaced: bool,
}

#[derive(Debug, Clone)]
pub struct BundleSummary {
    pub path: PathBuf,
    pub entry_count: usize,
}

/// File areas of a workspace, rooted at `<workspace>/files`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            root: workspace.join(FILES_DIR),
        }
    }

    pub fn background_dir(&self, template_id: i64) -> PathBuf {
        self.root
            .join(BACKGROUNDS_AREA)
            .join(template_id.to_string())
    }

    pub fn background_path(&self, template_id: i64, filename: &str) -> anyhow::Result<PathBuf> {
        Ok(self.background_dir(template_id).join(plain_name(filename)?))
    }

    pub fn certificate_path(&self, filename: &str) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(CERTIFICATES_AREA).join(plain_name(filename)?))
    }

    pub fn bundle_path(&self, filename: &str) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(BUNDLES_AREA).join(plain_name(filename)?))
    }

    pub fn preview_path(&self, filename: &str) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(PREVIEWS_AREA).join(plain_name(filename)?))
    }

    /// Copies `source` into the template's background area next to the
    /// current background. The previous file stays until
    /// [`FileStore::commit_background`] runs, so a failed database update can
    /// be rolled back with [`FileStore::discard_background`].
    pub fn import_background(&self, template_id: i64, source: &Path) -> anyhow::Result<StagedBackground> {
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid file name {}", source.to_string_lossy()))?
            .to_string();
        let bytes = std::fs::read(source)
            .with_context(|| format!("failed to read {}", source.to_string_lossy()))?;

        let dst = self.background_path(template_id, &filename)?;
        let replaced = self.write(&dst, &bytes)? == WriteOutcome::Replaced;
        Ok(StagedBackground { filename, replaced })
    }

    /// Drops every background file of the template except `keep`.
    pub fn commit_background(&self, template_id: i64, keep: &str) -> anyhow::Result<()> {
        let dir = self.background_dir(template_id);
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.to_string_lossy()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", dir.to_string_lossy()))?;
            if entry.file_name().to_str() == Some(keep) {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.with_context(|| format!("failed to remove {}", path.to_string_lossy()))?;
        }
        Ok(())
    }

    /// Removes a staged background that never made it into the database. A
    /// file that overwrote one of the same name is left in place.
    pub fn discard_background(&self, template_id: i64, staged: &StagedBackground) -> anyhow::Result<()> {
        if staged.replaced {
            return Ok(());
        }
        let path = self.background_path(template_id, &staged.filename)?;
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.to_string_lossy()))
    }

    /// Deletes the background area of a template that no longer exists.
    pub fn remove_backgrounds(&self, template_id: i64) -> anyhow::Result<()> {
        let dir = self.background_dir(template_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.to_string_lossy()))?;
        }
        Ok(())
    }

    pub fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        std::fs::read(path).with_context(|| format!("failed to read {}", path.to_string_lossy()))
    }

    /// Writes through a temporary sibling so readers never see a half file.
    pub fn write(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<WriteOutcome> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
        }
        let outcome = if path.exists() {
            WriteOutcome::Replaced
        } else {
            WriteOutcome::Created
        };
        let tmp = path.with_extension("writing");
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
            f.write_all(bytes)
                .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
            f.flush()
                .with_context(|| format!("failed to flush {}", tmp.to_string_lossy()))?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move file to {}", path.to_string_lossy()))?;
        Ok(outcome)
    }

    /// Zips certificate files into `bundles/<bundle_name>`, with a manifest
    /// listing what was included.
    pub fn bundle_certificates(
        &self,
        bundle_name: &str,
        filenames: &[String],
    ) -> anyhow::Result<BundleSummary> {
        let out_path = self.bundle_path(bundle_name)?;
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
        }
        let out_file = File::create(&out_path).with_context(|| {
            format!("failed to create output file {}", out_path.to_string_lossy())
        })?;
        let mut zip = ZipWriter::new(out_file);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let manifest = json!({
            "format": BUNDLE_FORMAT,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "createdAt": chrono::Utc::now().timestamp(),
            "files": filenames,
        });
        zip.start_file(MANIFEST_ENTRY, opts)
            .context("failed to start manifest entry")?;
        zip.write_all(
            serde_json::to_string_pretty(&manifest)
                .context("failed to serialize manifest")?
                .as_bytes(),
        )
        .context("failed to write manifest entry")?;

        for name in filenames {
            let path = self.certificate_path(name)?;
            let mut src = File::open(&path)
                .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
            zip.start_file(name.as_str(), opts)
                .with_context(|| format!("failed to start entry {}", name))?;
            std::io::copy(&mut src, &mut zip)
                .with_context(|| format!("failed to write entry {}", name))?;
        }

        zip.finish().context("failed to finalize zip bundle")?;
        Ok(BundleSummary {
            path: out_path,
            entry_count: filenames.len() + 1,
        })
    }
}

/// Rejects names that would escape their area.
fn plain_name(filename: &str) -> anyhow::Result<&str> {
    let ok = !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains('/')
        && !filename.contains('\\');
    if ok {
        Ok(filename)
    } else {
        Err(anyhow!("invalid file name: {}", filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn write_reports_created_then_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let path = store.certificate_path("a.pdf").expect("path");
        assert_eq!(store.write(&path, b"one").expect("write"), WriteOutcome::Created);
        assert_eq!(store.write(&path, b"two").expect("write"), WriteOutcome::Replaced);
        assert_eq!(store.read(&path).expect("read"), b"two");
    }

    #[test]
    fn import_background_keeps_previous_file_until_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        std::fs::write(&first, b"1").expect("write");
        std::fs::write(&second, b"2").expect("write");

        let listing = |store: &FileStore| {
            let mut names: Vec<_> = std::fs::read_dir(store.background_dir(3))
                .expect("dir")
                .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            names
        };

        let staged = store.import_background(3, &first).expect("import");
        assert_eq!(staged.filename, "first.png");
        store.commit_background(3, &staged.filename).expect("commit");

        let staged = store.import_background(3, &second).expect("import");
        assert_eq!(listing(&store), vec!["first.png", "second.png"]);
        store.discard_background(3, &staged).expect("discard");
        assert_eq!(listing(&store), vec!["first.png"]);

        let staged = store.import_background(3, &second).expect("import");
        store.commit_background(3, &staged.filename).expect("commit");
        assert_eq!(listing(&store), vec!["second.png"]);

        // re-importing the same name overwrites it, so discarding keeps it
        let staged = store.import_background(3, &second).expect("import");
        store.discard_background(3, &staged).expect("discard");
        assert_eq!(listing(&store), vec!["second.png"]);
    }

    #[test]
    fn names_cannot_escape_their_area() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        assert!(store.certificate_path("../x.pdf").is_err());
        assert!(store.certificate_path("..").is_err());
        assert!(store.bundle_path("").is_err());
    }

    #[test]
    fn bundle_contains_manifest_and_certificates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        for name in ["a.pdf", "b.pdf"] {
            let p = store.certificate_path(name).expect("path");
            store.write(&p, name.as_bytes()).expect("write");
        }
        let summary = store
            .bundle_certificates("out.zip", &["a.pdf".to_string(), "b.pdf".to_string()])
            .expect("bundle");
        assert_eq!(summary.entry_count, 3);

        let f = File::open(&summary.path).expect("open");
        let mut archive = zip::ZipArchive::new(f).expect("zip");
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .expect("manifest")
            .read_to_string(&mut manifest)
            .expect("read");
        assert!(manifest.contains(BUNDLE_FORMAT));
        let mut body = String::new();
        archive
            .by_name("b.pdf")
            .expect("entry")
            .read_to_string(&mut body)
            .expect("read");
        assert_eq!(body, "b.pdf");
    }
}
