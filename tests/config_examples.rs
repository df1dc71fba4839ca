use std::{fs, path::PathBuf};

use reqlog::config::{BackendKind, Config};

#[test]
fn bundled_demo_configs_parse() {
    let demos_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos");
    let entries = fs::read_dir(&demos_dir).expect("demos directory should exist");

    let mut backends = Vec::new();
    for entry in entries {
        let path = entry.expect("directory entry should be readable").path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }

        let config = Config::from_path(&path)
            .unwrap_or_else(|err| panic!("demo config {} should parse: {err:#}", path.display()));
        backends.push(config.storage.backend);
    }

    assert!(backends.contains(&BackendKind::File), "{backends:?}");
    assert!(backends.contains(&BackendKind::ObjectStore), "{backends:?}");
}
