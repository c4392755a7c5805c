//! Integration test: upload stemcells through external CPI executables into
//! a file-backed catalog.
//!
//! Each CPI is a small shell script speaking the JSON-over-stdio protocol, so
//! the whole pipeline runs for real: extraction, digest tool, CPI processes
//! and the atomic catalog file.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use stemcell_core::{DirectorConfig, EventLog, StageEventKind, StemcellError, StemcellKey};
use stemcell_runtime::{
    CatalogStore, CloudFactory, ExternalCpiProvider, FileCatalog, IntegrityVerifier,
    MultiDigestTool, ProvisionState, UpdateStemcell, UpdateStemcellOptions,
};
use tempfile::TempDir;

const MANIFEST: &str = r#"
name: jeos
version: 5
operating_system: jeos-5
stemcell_formats: [dummy]
cloud_properties:
  ram: 2gb
sha1: shawone
"#;

fn write_stemcell(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in [("stemcell.MF", MANIFEST.as_bytes()), ("image", b"image".as_slice())] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Write a CPI script answering `info` with `formats` and `create_stemcell`
/// with `create_reply`. Every create call is appended to `creates.log`.
fn write_cpi(dir: &Path, name: &str, formats: &str, create_reply: &str) -> PathBuf {
    let path = dir.join(format!("{}-cpi", name));
    let script = format!(
        r#"#!/bin/sh
request=$(cat)
case "$request" in
  *'"method":"info"'*)
    echo '{{"result":{{"stemcell_formats":{formats},"api_version":2}},"error":null,"log":""}}'
    ;;
  *'"method":"create_stemcell"'*)
    echo "{name}" >> {log}
    echo '{create_reply}'
    ;;
esac
"#,
        formats = formats,
        name = name,
        log = dir.join("creates.log").display(),
        create_reply = create_reply,
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn created_in(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("creates.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

struct Director {
    tmp: TempDir,
    config: DirectorConfig,
}

impl Director {
    /// Configure cloud1 and cloud3 accepting `dummy` and cloud2 accepting only `dummy1`.
    fn three_clouds(cloud1_reply: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let ok = |cid: &str| format!(r#"{{"result":"{}","error":null,"log":""}}"#, cid);
        let cloud1 = write_cpi(tmp.path(), "cloud1", r#"["dummy"]"#, cloud1_reply);
        let cloud2 = write_cpi(tmp.path(), "cloud2", r#"["dummy1"]"#, &ok("stemcell-cid2"));
        let cloud3 = write_cpi(tmp.path(), "cloud3", r#"["dummy"]"#, &ok("stemcell-cid3"));

        let yaml = format!(
            r#"
director_uuid: meow-uuid
store_dir: {store}
tmp_dir: {work}
verify_multidigest_path: "true"
cpi_timeout_secs: 30
cpis:
  - name: cloud1
    exec_path: {cloud1}
  - name: cloud2
    exec_path: {cloud2}
  - name: cloud3
    exec_path: {cloud3}
"#,
            store = tmp.path().join("catalog").display(),
            work = tmp.path().join("work").display(),
            cloud1 = cloud1.display(),
            cloud2 = cloud2.display(),
            cloud3 = cloud3.display(),
        );
        let config = DirectorConfig::from_yaml(&yaml).unwrap();
        Self { tmp, config }
    }

    fn stemcell(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        write_stemcell(&path);
        path
    }

    async fn catalog(&self) -> Arc<FileCatalog> {
        Arc::new(FileCatalog::open(&self.config.store_dir).await.unwrap())
    }

    fn job(&self, catalog: Arc<FileCatalog>, options: UpdateStemcellOptions) -> UpdateStemcell {
        let provider = ExternalCpiProvider::new(
            self.config.director_uuid.clone(),
            self.config.preferred_cpi_api_version,
            Duration::from_secs(self.config.cpi_timeout_secs),
        );
        let clouds = CloudFactory::from_config(&self.config, Arc::new(provider));
        let tool = MultiDigestTool::new(
            &self.config.verify_multidigest_path,
            Duration::from_secs(self.config.digest_timeout_secs),
        );
        UpdateStemcell::new(options, clouds, catalog, IntegrityVerifier::new(Arc::new(tool)))
            .with_tmp_dir(&self.config.tmp_dir)
    }
}

#[tokio::test]
async fn test_upload_to_multiple_cpis_persists_catalog() {
    let director = Director::three_clouds(r#"{"result":"stemcell-cid1","error":null,"log":""}"#);
    let catalog = director.catalog().await;
    let events = EventLog::new(64);
    let mut rx = events.subscribe();

    let job = director
        .job(catalog, UpdateStemcellOptions::local(director.stemcell("upload.tgz")))
        .with_progress(Arc::new(events.clone()));
    assert_eq!(job.perform().await.unwrap(), "/stemcells/jeos/5");
    assert_eq!(job.state(), ProvisionState::Done);
    assert_eq!(created_in(director.tmp.path()), vec!["cloud1", "cloud3"]);

    let mut advanced = 0;
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.stage, "Update stemcell");
        assert_eq!(event.total, 11);
        if matches!(event.kind, StageEventKind::Advanced { .. }) {
            advanced += 1;
        }
    }
    assert_eq!(advanced, 11);

    // Everything is visible after reopening the catalog file
    let reopened = director.catalog().await;
    let entries = reopened.stemcells("jeos", "5").await.unwrap();
    let rows: Vec<_> = entries
        .iter()
        .map(|e| (e.cpi.as_str(), e.cid.as_str(), e.digest.as_str()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("cloud1", "stemcell-cid1", "shawone"),
            ("cloud3", "stemcell-cid3", "shawone"),
        ]
    );
    assert_eq!(reopened.evaluations("jeos", "5").await.unwrap().len(), 3);
    assert!(reopened
        .has_evaluation(StemcellKey::new("jeos", "5", "cloud2"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_reupload_is_idempotent() {
    let director = Director::three_clouds(r#"{"result":"stemcell-cid1","error":null,"log":""}"#);

    let first = director
        .job(director.catalog().await, UpdateStemcellOptions::local(director.stemcell("a.tgz")))
        .perform()
        .await
        .unwrap();
    let second = director
        .job(director.catalog().await, UpdateStemcellOptions::local(director.stemcell("b.tgz")))
        .perform()
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(created_in(director.tmp.path()).len(), 2);
    assert_eq!(director.catalog().await.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cpi_failure_leaves_catalog_untouched() {
    let director = Director::three_clouds(
        r#"{"result":null,"error":{"type":"Bosh::Clouds::CloudError","message":"I am flaky","ok_to_retry":false},"log":""}"#,
    );
    let archive = director.stemcell("upload.tgz");
    let catalog = director.catalog().await;

    let err = director
        .job(catalog.clone(), UpdateStemcellOptions::local(&archive))
        .perform()
        .await
        .unwrap_err();

    assert!(matches!(err, StemcellError::BackendCreation { ref alias, .. } if alias == "cloud1"));
    assert!(err.to_string().contains("I am flaky"));
    assert_eq!(created_in(director.tmp.path()), vec!["cloud1"]);
    assert!(catalog.list().await.unwrap().is_empty());
    assert!(catalog.evaluations("jeos", "5").await.unwrap().is_empty());
    assert!(!catalog.path().exists());
    assert!(!archive.exists());
}

#[tokio::test]
async fn test_digest_tool_rejection() {
    let mut director =
        Director::three_clouds(r#"{"result":"stemcell-cid1","error":null,"log":""}"#);
    director.config.verify_multidigest_path = PathBuf::from("false");

    let err = director
        .job(
            director.catalog().await,
            UpdateStemcellOptions::local(director.stemcell("upload.tgz"))
                .with_expected_digest("sha1:abcdef"),
        )
        .perform()
        .await
        .unwrap_err();

    assert!(matches!(err, StemcellError::DigestMismatch { .. }));
    assert!(created_in(director.tmp.path()).is_empty());
}

#[tokio::test]
async fn test_remote_upload_from_file_url() {
    let director = Director::three_clouds(r#"{"result":"stemcell-cid1","error":null,"log":""}"#);
    let url = format!("file://{}", director.stemcell("remote.tgz").display());

    let path = director
        .job(
            director.catalog().await,
            UpdateStemcellOptions::remote(url).with_expected_digest("sha1:abcdef"),
        )
        .perform()
        .await
        .unwrap();

    assert_eq!(path, "/stemcells/jeos/5");
    assert_eq!(created_in(director.tmp.path()), vec!["cloud1", "cloud3"]);
}
