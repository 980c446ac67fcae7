use canopy::handlers::*;
use canopy_core::stage::{SPECIES_STAGE, StageStore, plan_stage};
use canopy_scanner::Entity;
use std::io::Write;
use std::path::PathBuf;
use tempfile::{NamedTempFile, TempDir};

fn entity(id: &str) -> Entity {
    Entity {
        id: id.to_string(),
        name: format!("Bird {}", id),
        scientific_name: String::new(),
        parent_family: String::new(),
        parent_order: String::new(),
        detail_url: format!("https://www.inaturalist.org/taxa/{}", id),
        api_image_url: None,
    }
}

#[test]
fn test_resolve_data_dir_plain() {
    assert_eq!(resolve_data_dir("./data"), PathBuf::from("./data"));
}

#[test]
fn test_resolve_data_dir_expands_tilde() {
    let resolved = resolve_data_dir("~/canopy-data");
    assert!(resolved.ends_with("canopy-data"));
    if std::env::var_os("HOME").is_some() {
        assert!(!resolved.to_string_lossy().starts_with('~'));
    }
}

#[test]
fn test_load_config_defaults_without_file() {
    let config = load_config(None).unwrap();
    assert_eq!(config.workers, 4);
    assert_eq!(config.retry_schedule_secs, vec![0, 5, 15]);
}

#[test]
fn test_load_config_from_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut temp_file = NamedTempFile::new()?;
    writeln!(temp_file, r#"{{"workers": 2, "headless": false}}"#)?;

    let path = PathBuf::from(temp_file.path());
    let config = load_config(Some(&path))?;

    assert_eq!(config.workers, 2);
    assert!(!config.headless);
    assert_eq!(config.report_every, 20);
    Ok(())
}

#[test]
fn test_load_config_invalid_json() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "workers = 2").unwrap();

    let path = PathBuf::from(temp_file.path());
    let result = load_config(Some(&path));
    assert!(result.is_err());
    assert!(format!("{:#}", result.unwrap_err()).contains("invalid config"));
}

#[test]
fn test_load_entities_by_stage_name() {
    let dir = TempDir::new().unwrap();
    let stages = StageStore::open(dir.path()).unwrap();
    stages.write(SPECIES_STAGE, &vec![entity("1"), entity("2")]).unwrap();
    stages.write(&plan_stage("3"), &vec![entity("9")]).unwrap();

    assert_eq!(load_entities(&stages, SPECIES_STAGE).unwrap().len(), 2);
    let plan = load_entities(&stages, &plan_stage("3")).unwrap();
    assert_eq!(plan[0].id, "9");
}

#[test]
fn test_load_entities_by_path() {
    let dir = TempDir::new().unwrap();
    let stages = StageStore::open(dir.path().join("planning")).unwrap();
    let file = dir.path().join("custom_plan.json");
    std::fs::write(&file, serde_json::to_string(&vec![entity("5")]).unwrap()).unwrap();

    let entities = load_entities(&stages, &file.to_string_lossy()).unwrap();
    assert_eq!(entities.len(), 1);
}

#[test]
fn test_load_entities_rejects_missing_or_empty_stage() {
    let dir = TempDir::new().unwrap();
    let stages = StageStore::open(dir.path()).unwrap();

    let missing = load_entities(&stages, SPECIES_STAGE);
    assert!(format!("{:#}", missing.unwrap_err()).contains("Cannot load entities"));

    stages.write(SPECIES_STAGE, &Vec::<Entity>::new()).unwrap();
    let empty = load_entities(&stages, SPECIES_STAGE);
    assert!(empty.unwrap_err().to_string().contains("holds no entities"));
}
