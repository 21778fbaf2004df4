use std::{
    io::prelude::*,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::{capture::scripted::ScriptedSettings, frame::VideoMode};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HeaderSettingsFile {
    pub name: String,
    pub version: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SchedulerSettings {
    /// How long the scheduler waits for an input master before ticking anyway.
    pub master_timeout_ms: u64,
    pub hard_queue_ceiling: usize,
    /// Slots below this index always show something.
    pub min_sources: usize,
    pub master_slot: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            master_timeout_ms: 200,
            hard_queue_ceiling: 16,
            min_sources: 2,
            master_slot: 0,
        }
    }
}

/// A source attached when the engine starts, in slot order.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSettings {
    Fake { mode: VideoMode },
    Scripted(ScriptedSettings),
}

/// A software output paced by a timer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OutputSettings {
    pub slot: usize,
    pub clock_master: bool,
    #[serde(default)]
    pub preroll_beats: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SettingsStruct {
    pub header: HeaderSettingsFile,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Mode of the fillers installed on empty slots.
    #[serde(default)]
    pub fake_mode: VideoMode,
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub output: Option<OutputSettings>,
}

impl Default for SettingsStruct {
    fn default() -> Self {
        SettingsStruct {
            header: HeaderSettingsFile {
                name: "Sync Mixer".to_string(),
                version: 0,
            },
            scheduler: SchedulerSettings::default(),
            fake_mode: VideoMode::default(),
            sources: vec![SourceSettings::Scripted(ScriptedSettings::new(
                "Scripted Camera 1",
                VideoMode::new(1280, 720, 60, 1),
            ))],
            output: None,
        }
    }
}

#[derive(Debug)]
struct ManagerStruct {
    pub file_name: PathBuf,
    pub config: SettingsStruct,
}

#[derive(Debug, Default)]
struct Manager {
    pub content: Option<ManagerStruct>,
}

lazy_static! {
    static ref MANAGER: Arc<Mutex<Manager>> = Default::default();
}

impl Manager {
    fn new(file_name: &str, reset: bool) -> Result<ManagerStruct> {
        let file_name = settings_path(file_name)?;

        debug!("Using settings file: {file_name:?}");

        let settings = ManagerStruct {
            config: load_settings_from_file(&file_name, reset),
            file_name,
        };

        if let Err(error) = save_settings_to_file(&settings.file_name, &settings.config) {
            error!("Failed to save file: {error:#?}");
        }

        Ok(settings)
    }
}

/// Relative names live in the user configuration folder.
fn settings_path(file_name: &str) -> Result<PathBuf> {
    if Path::new(file_name).is_absolute() {
        return Ok(file_name.into());
    }

    let project = ProjectDirs::from("com", "Sync Mixer", env!("CARGO_PKG_NAME"))
        .ok_or_else(|| anyhow!("Failed to find user settings path"))?;
    let folder_path = project.config_dir();
    std::fs::create_dir_all(folder_path)
        .with_context(|| format!("Failed to create settings folder: {folder_path:?}"))?;

    Ok(folder_path.join(file_name))
}

// Init settings manager with the desired settings file,
// will be created if does not exist
pub fn init(file_name: Option<&str>, reset: bool) -> Result<()> {
    let file_name = file_name.unwrap_or("settings.json");
    let content = Manager::new(file_name, reset)?;
    MANAGER.lock().content = Some(content);
    Ok(())
}

fn load_settings_from_file(file_name: &Path, reset: bool) -> SettingsStruct {
    if reset {
        info!("Settings reset requested, using defaults");
        return SettingsStruct::default();
    }

    let content = match std::fs::read_to_string(file_name) {
        Ok(content) => content,
        Err(error) => {
            debug!("No settings loaded from {file_name:?}: {error}");
            return SettingsStruct::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|error| {
        warn!("Failed to parse settings file {file_name:?}, using defaults. Reason: {error}");
        SettingsStruct::default()
    })
}

fn save_settings_to_file(file_name: &Path, content: &SettingsStruct) -> Result<()> {
    let mut file = std::fs::File::create(file_name)
        .with_context(|| format!("Failed to create settings file {file_name:?}"))?;
    let value = serde_json::to_string_pretty(content)?;
    file.write_all(value.as_bytes())?;
    Ok(())
}

// Reload the settings from the file in use
pub fn load() {
    let mut manager = MANAGER.lock();
    match &mut manager.content {
        Some(content) => content.config = load_settings_from_file(&content.file_name, false),
        None => error!("Failed to load settings: manager not initialized"),
    }
}

// Save the latest state of the settings
pub fn save() {
    let manager = MANAGER.lock();
    if let Some(content) = &manager.content {
        if let Err(error) = save_settings_to_file(&content.file_name, &content.config) {
            error!(
                "Failed to save settings: file: {:#?}, configuration: {:#?}, error: {error:#?}",
                &content.file_name, &content.config
            );
        }
    }
}

fn with_config<T>(read: impl FnOnce(&SettingsStruct) -> T) -> T {
    let manager = MANAGER.lock();
    match &manager.content {
        Some(content) => read(&content.config),
        None => read(&SettingsStruct::default()),
    }
}

fn update_config(write: impl FnOnce(&mut SettingsStruct)) {
    {
        let mut manager = MANAGER.lock();
        match manager.content.as_mut() {
            Some(content) => write(&mut content.config),
            None => {
                error!("Failed to update settings: manager not initialized");
                return;
            }
        }
    }
    save();
}

pub fn settings() -> SettingsStruct {
    with_config(SettingsStruct::clone)
}

pub fn header() -> HeaderSettingsFile {
    with_config(|config| config.header.clone())
}

pub fn scheduler() -> SchedulerSettings {
    with_config(|config| config.scheduler.clone())
}

pub fn set_scheduler(scheduler: SchedulerSettings) {
    update_config(|config| config.scheduler = scheduler);
}

pub fn fake_mode() -> VideoMode {
    with_config(|config| config.fake_mode)
}

pub fn sources() -> Vec<SourceSettings> {
    with_config(|config| config.sources.clone())
}

pub fn set_sources(sources: &[SourceSettings]) {
    update_config(|config| config.sources = sources.to_vec());
}

pub fn output() -> Option<OutputSettings> {
    with_config(|config| config.output.clone())
}

pub fn set_output(output: Option<OutputSettings>) {
    update_config(|config| config.output = output);
}
