//! On-disk channel name tables (ttl.yaml / dds.yaml): a YAML list of one
//! name per channel.

use std::path::PathBuf;

pub struct NamesConfig {
    path: PathBuf,
    names: Vec<String>,
}

impl NamesConfig {
    /// Load the table, padding or truncating to `count` entries. A missing
    /// or malformed file just yields empty names.
    pub fn load(path: PathBuf, count: usize) -> NamesConfig {
        let mut names = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_yaml::from_str::<Vec<String>>(&text) {
                Ok(names) => names,
                Err(err) => {
                    log::error!("{}: not a list of names: {}", path.display(), err);
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                log::error!("cannot read {}: {}", path.display(), err);
                Vec::new()
            }
        };
        names.resize(count, String::new());
        NamesConfig { path, names }
    }

    pub fn save(&self) {
        let yaml = match serde_yaml::to_string(&self.names) {
            Ok(yaml) => yaml,
            Err(err) => {
                log::error!("cannot serialize {}: {}", self.path.display(), err);
                return;
            }
        };
        if let Err(err) = std::fs::write(&self.path, yaml) {
            log::error!("cannot save {}: {}", self.path.display(), err);
        }
    }

    pub fn get(&self, chn: usize) -> Option<&str> {
        self.names.get(chn).map(|s| s.as_str())
    }

    pub fn set(&mut self, chn: usize, name: &str) -> bool {
        match self.names.get_mut(chn) {
            Some(slot) => {
                *slot = name.into();
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> &[String] {
        &self.names
    }
}
