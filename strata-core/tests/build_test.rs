//! End-to-end builds against temporary root filesystems.
//!
//! These exercise the whole pipeline (parse, execute, snapshot, assemble)
//! without any registry: bases are scratch or saved stages, and outputs are
//! inspected in memory or via tarballs.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use strata_core::image::{tarball, Image};
use strata_core::{do_build, BuildOptions, SnapshotMode};
use tempfile::TempDir;

struct BuildFixture {
    _dirs: Vec<TempDir>,
    opts: BuildOptions,
}

fn fixture(dockerfile: &str, files: &[(&str, &str)]) -> BuildFixture {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let context = TempDir::new().unwrap();

    fs::write(context.path().join("Dockerfile"), dockerfile).unwrap();
    for (name, contents) in files {
        let path = context.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    let opts = BuildOptions {
        context: context.path().to_path_buf(),
        root_dir: root.path().to_path_buf(),
        work_dir: work.path().to_path_buf(),
        ..Default::default()
    };
    BuildFixture { _dirs: vec![root, work, context], opts }
}

fn layer_entries(image: &Image, index: usize) -> BTreeMap<String, Vec<u8>> {
    let tar = image.layers[index].uncompressed().unwrap();
    let mut archive = tar::Archive::new(tar.as_slice());
    let mut out = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().display().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        out.insert(path, data);
    }
    out
}

#[tokio::test]
async fn test_scratch_copy_produces_exactly_one_layer() {
    let f = fixture("FROM scratch\nCOPY foo /foo\n", &[("foo", "abc")]);
    let image = do_build(&f.opts).await.unwrap();

    assert_eq!(image.layers.len(), 1);
    let entries = layer_entries(&image, 0);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries.get("foo").map(Vec::as_slice), Some(b"abc".as_slice()));
    // Scratch keeps the default PATH env.
    assert_eq!(
        image.config_file.config.env,
        vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()]
    );
}

#[tokio::test]
async fn test_config_only_build_appends_zero_layers() {
    let f = fixture("FROM scratch\nENV A=1\nLABEL b=c\n", &[]);
    let image = do_build(&f.opts).await.unwrap();

    assert!(image.layers.is_empty());
    assert!(image.config_file.config.env.contains(&"A=1".to_string()));
    assert_eq!(
        image.config_file.config.labels.get("b").map(String::as_str),
        Some("c")
    );
}

#[tokio::test]
async fn test_run_deletion_emits_whiteout() {
    let f = fixture(
        "FROM scratch\nCOPY hostname /etc/hostname\nRUN rm /etc/hostname\n",
        &[("hostname", "h")],
    );
    let image = do_build(&f.opts).await.unwrap();

    let last = image.layers.len() - 1;
    let entries = layer_entries(&image, last);
    assert!(entries.contains_key("etc/.wh.hostname"));
    assert_eq!(entries.get("etc/.wh.hostname").map(Vec::len), Some(0));
    assert!(!entries.contains_key("etc/hostname"));
}

#[tokio::test]
async fn test_noop_run_adds_history_but_no_layer() {
    let f = fixture("FROM scratch\nCOPY foo /foo\nRUN true\n", &[("foo", "x")]);
    let image = do_build(&f.opts).await.unwrap();

    assert_eq!(image.layers.len(), 1);
    let history: Vec<(&str, bool)> = image
        .config_file
        .history
        .iter()
        .map(|h| (h.created_by.as_str(), h.empty_layer))
        .collect();
    assert_eq!(history, vec![("COPY foo /foo", false), ("RUN true", true)]);
}

#[tokio::test]
async fn test_multi_stage_final_image_has_only_copied_file() {
    let f = fixture(
        "FROM scratch AS build\nCOPY x /x\nCOPY helper /helper\n\
         FROM scratch\nCOPY --from=build /x /x\n",
        &[("x", "wanted"), ("helper", "unwanted")],
    );
    let image = do_build(&f.opts).await.unwrap();

    assert_eq!(image.layers.len(), 1);
    let entries = layer_entries(&image, 0);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries.get("x").map(Vec::as_slice), Some(b"wanted".as_slice()));

    // Stage 0 was persisted for the --from reference.
    let saved = tarball::read_from_file(&f.opts.intermediate_stage_path(0)).unwrap();
    let saved_entries = layer_entries(&saved, 0);
    assert!(saved_entries.contains_key("helper"));
}

#[tokio::test]
async fn test_layer_order_matches_instruction_order() {
    let f = fixture(
        "FROM scratch\nCOPY a /a\nENV SKIP=1\nCOPY b /b\nRUN rm /a\n",
        &[("a", "1"), ("b", "2")],
    );
    let image = do_build(&f.opts).await.unwrap();

    assert_eq!(image.layers.len(), 3);
    assert!(layer_entries(&image, 0).contains_key("a"));
    assert!(layer_entries(&image, 1).contains_key("b"));
    assert!(layer_entries(&image, 2).contains_key(".wh.a"));

    let created_by: Vec<&str> = image
        .config_file
        .history
        .iter()
        .map(|h| h.created_by.as_str())
        .collect();
    assert_eq!(
        created_by,
        vec!["COPY a /a", "ENV SKIP=1", "COPY b /b", "RUN rm /a"]
    );
}

#[tokio::test]
async fn test_reproducible_double_build_identical_digest() {
    let build = |reproducible: bool| async move {
        let f = fixture(
            "FROM scratch\nCOPY foo /foo\nRUN rm /foo\nENV A=1\n",
            &[("foo", "payload")],
        );
        let mut opts = f.opts.clone();
        opts.reproducible = reproducible;
        do_build(&opts).await.unwrap().digest().unwrap()
    };

    let first = build(true).await;
    let second = build(true).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_time_snapshot_mode_builds() {
    let f = fixture("FROM scratch\nCOPY foo /foo\n", &[("foo", "abc")]);
    let mut opts = f.opts.clone();
    opts.snapshot_mode = SnapshotMode::Time;
    let image = do_build(&opts).await.unwrap();
    assert_eq!(image.layers.len(), 1);
}

#[tokio::test]
async fn test_volume_paths_excluded_from_later_layers() {
    // VOLUME whitelists /data for the rest of the stage: writes under it
    // must not be captured, while sibling writes still are.
    let f = fixture(
        "FROM scratch\nVOLUME /data\nRUN mkdir data && echo secret > data/f\n\
         RUN echo x > visible\n",
        &[],
    );
    let image = do_build(&f.opts).await.unwrap();

    let mut all = BTreeMap::new();
    for index in 0..image.layers.len() {
        all.extend(layer_entries(&image, index));
    }
    assert!(all.contains_key("visible"));
    assert!(!all.keys().any(|k| k.starts_with("data")));
}

#[tokio::test]
async fn test_workdir_scopes_relative_copy() {
    let f = fixture(
        "FROM scratch\nWORKDIR /app\nCOPY foo conf/settings\n",
        &[("foo", "cfg")],
    );
    let image = do_build(&f.opts).await.unwrap();

    let mut all = BTreeMap::new();
    for index in 0..image.layers.len() {
        all.extend(layer_entries(&image, index));
    }
    assert_eq!(
        all.get("app/conf/settings").map(Vec::as_slice),
        Some(b"cfg".as_slice())
    );
    assert_eq!(image.config_file.config.working_dir, "/app");
}

#[tokio::test]
async fn test_tarball_round_trip_preserves_digest() {
    let f = fixture("FROM scratch\nCOPY foo /foo\n", &[("foo", "abc")]);
    let image = do_build(&f.opts).await.unwrap();

    let out = TempDir::new().unwrap();
    let tar_path: PathBuf = out.path().join("image.tar");
    tarball::write_to_file(&tar_path, Some("example.com/app:1"), &image).unwrap();
    let loaded = tarball::read_from_file(&tar_path).unwrap();

    assert_eq!(loaded.digest().unwrap(), image.digest().unwrap());
}
