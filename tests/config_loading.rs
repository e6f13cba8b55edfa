//! Loading model configurations from JSON and TOML files

use looptree::parse::{load_config, ParseError};
use looptree::pipeline::LooptreeModel;
use looptree::SpaceTime;
use std::fs;
use tempfile::TempDir;

const TOML_CONFIG: &str = r#"
[model]
verbose = true
max_hops = 2

[variables]
N = 8
TI = 4

[[problem.data_spaces]]
name = "D0"
dims = ["d0", "d1"]

[[problem.einsums]]
name = "E"
dims = ["i", "j"]
extents = ["N", 4]
writes = [{ data_space = "D0", projection = ["i", "j"] }]

[mapping]
type = "for"
dim = "i"
tile_size = "TI"

[mapping.child]
type = "par_for"
dim = "j"
tile_size = 2

[mapping.child.child]
type = "storage"
buffer = "B0"
data_spaces = ["D0"]

[mapping.child.child.child]
type = "compute"
einsum = "E"
"#;

const JSON_CONFIG: &str = r#"{
    "variables": { "N": 8 },
    "problem": {
        "data_spaces": [{ "name": "D0", "dims": ["d0", "d1"], "extents": ["N", 4] }],
        "einsums": [{
            "name": "E", "dims": ["i", "j"], "extents": ["N", 4],
            "writes": [{ "data_space": "D0", "projection": ["i", "j"] }]
        }]
    },
    "mapping": {
        "type": "for", "dim": "i", "tile_size": 4,
        "child": {
            "type": "par_for", "dim": "j", "tile_size": 2,
            "child": {
                "type": "storage", "buffer": "B0", "data_spaces": ["D0"],
                "child": { "type": "compute", "einsum": "E" }
            }
        }
    }
}"#;

fn write_config(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_toml_config_runs() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "model.toml", TOML_CONFIG);

    let config = load_config(&path).unwrap();
    assert!(config.model.verbose);
    assert_eq!(config.model_options().reuse.max_hops, 2);

    let model = LooptreeModel::from_config(&config).unwrap();
    let result = model.run().unwrap();
    let e = model.workload().einsum_name_to_id()["E"];
    assert_eq!(result.ops[&e].total, Some(32));
    assert_eq!(result.ops[&e].dim_tags, vec![SpaceTime::Temporal, SpaceTime::Spatial]);
}

#[test]
fn test_json_and_toml_agree() {
    let dir = TempDir::new().unwrap();
    let toml_path = write_config(&dir, "model.toml", TOML_CONFIG);
    let json_path = write_config(&dir, "model.json", JSON_CONFIG);

    let from_toml = LooptreeModel::from_config(&load_config(&toml_path).unwrap()).unwrap();
    let from_json = LooptreeModel::from_config(&load_config(&json_path).unwrap()).unwrap();
    let a = from_toml.run().unwrap();
    let b = from_json.run().unwrap();
    assert_eq!(a.ops, b.ops);
    assert_eq!(a.occupancy, b.occupancy);
    assert_eq!(a.temporal_steps, b.temporal_steps);
}

#[test]
fn test_unknown_variable_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "model.json", &JSON_CONFIG.replace("\"tile_size\": 4", "\"tile_size\": \"TJ\""));
    let config = load_config(&path).unwrap();
    match LooptreeModel::from_config(&config) {
        Err(looptree::ModelError::Config(ParseError::UnknownVariable(name))) => assert_eq!(name, "TJ"),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("expected an unknown variable error"),
    }
}

#[test]
fn test_unsupported_extension() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "model.yaml", "mapping: {}");
    assert!(matches!(load_config(&path), Err(ParseError::UnsupportedFormat(ext)) if ext == "yaml"));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.json");
    assert!(matches!(load_config(&path), Err(ParseError::IOError(_))));
}
