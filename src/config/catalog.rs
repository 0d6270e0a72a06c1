//! Named fleet specifications parsed from a JSON catalog.
//!
//! The catalog layout nests one object per fleet under `machines`:
//!
//! ```json
//! {"machines": {"web": {"AMI": "ami-1", "size": "m5.large", "instances": 2,
//!   "disk": 8, "OS": "Linux/UNIX", "keypair_name": "fleet",
//!   "SSH_user": "ubuntu", "RETRIEVE_FILES": "app.log"}}}
//! ```
//!
//! Every key of a fleet entry is also kept as an upper-cased named
//! parameter.

use std::collections::BTreeMap;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use tracing::debug;

use super::{ConfigError, FleetSpec, FleetSpecBuilder};
use crate::price::Price;

const IMAGE_ID_KEY: &str = "AMI";
const SIZE_KEY: &str = "size";
const DONT_OVERRIDE_TYPE_KEY: &str = "dont_override_type";
const INSTANCES_KEY: &str = "instances";
const DISK_KEY: &str = "disk";
const OS_KEY: &str = "OS";
const KEYPAIR_NAME_KEY: &str = "keypair_name";
const SSH_USER_KEY: &str = "SSH_user";
const SSH_PASS_KEY: &str = "SSH_pass";
const PROVIDER_KEY: &str = "provider";

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    machines: BTreeMap<String, BTreeMap<String, Scalar>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Flag(bool),
    Integer(i64),
    Text(String),
    Other(serde_json::Value),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Self::Flag(flag) => flag.to_string(),
            Self::Integer(number) => number.to_string(),
            Self::Text(text) => text.clone(),
            Self::Other(value) => value.to_string(),
        }
    }

    fn integer(&self, field: &str, fleet: &str) -> Result<i64, ConfigError> {
        match self {
            Self::Integer(number) => Ok(*number),
            Self::Text(text) => {
                text.trim()
                    .parse::<i64>()
                    .map_err(|err| ConfigError::InvalidValue {
                        field: format!("{field} for fleet `{fleet}`"),
                        message: err.to_string(),
                    })
            }
            other => Err(ConfigError::InvalidValue {
                field: format!("{field} for fleet `{fleet}`"),
                message: format!("expected an integer, got {}", other.text()),
            }),
        }
    }

    fn flag(&self) -> bool {
        match self {
            Self::Flag(flag) => *flag,
            Self::Integer(number) => *number != 0,
            Self::Text(text) => matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1"
            ),
            Self::Other(_) => false,
        }
    }
}

/// Fleet specifications keyed by fleet name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FleetCatalog {
    fleets: BTreeMap<String, FleetSpec>,
}

impl FleetCatalog {
    /// Parses a catalog, applying `price_margin` to every fleet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and any validation
    /// error raised while building a fleet.
    pub fn from_json_str(raw: &str, price_margin: Price) -> Result<Self, ConfigError> {
        let document: CatalogDocument = serde_json::from_str(raw)?;
        let mut fleets = BTreeMap::new();
        for (name, entry) in document.machines {
            let spec = Self::build_spec(&name, &entry, price_margin)?;
            debug!(
                fleet = %name,
                image_id = spec.image_id(),
                size = spec.size(),
                count = spec.desired_count(),
                "loaded fleet specification"
            );
            fleets.insert(name, spec);
        }
        Ok(Self { fleets })
    }

    /// Reads and parses a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`FleetCatalog::from_json_str`].
    pub fn load(path: &Utf8Path, price_margin: Price) -> Result<Self, ConfigError> {
        let io_error = |err: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        };
        let parent = path
            .parent()
            .filter(|dir| !dir.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
            path: path.to_path_buf(),
            message: String::from("path has no file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(io_error)?;
        let raw = dir.read_to_string(file_name).map_err(io_error)?;
        Self::from_json_str(&raw, price_margin)
    }

    /// Looks up a fleet by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownFleet`] when no fleet has that name.
    pub fn get(&self, name: &str) -> Result<&FleetSpec, ConfigError> {
        self.fleets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFleet(name.to_owned()))
    }

    /// Returns the name of the first fleet (by name order) booting `image_id`.
    #[must_use]
    pub fn name_for_image(&self, image_id: &str) -> Option<&str> {
        self.fleets
            .iter()
            .find(|(_, spec)| spec.image_id() == image_id)
            .map(|(name, _)| name.as_str())
    }

    /// Iterates over fleet names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fleets.keys().map(String::as_str)
    }

    /// Number of fleets in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fleets.len()
    }

    /// Returns `true` when the catalog holds no fleets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fleets.is_empty()
    }

    fn build_spec(
        name: &str,
        entry: &BTreeMap<String, Scalar>,
        price_margin: Price,
    ) -> Result<FleetSpec, ConfigError> {
        let lookup = |key: &str| {
            entry
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        };
        let text = |key: &str| lookup(key).map(Scalar::text).unwrap_or_default();
        let optional_text = |key: &str| lookup(key).map(Scalar::text);
        let integer = |key: &str| {
            lookup(key).map_or(Ok(0), |value| value.integer(key, name))
        };

        let mut builder = FleetSpecBuilder::new(name)
            .image_id(text(IMAGE_ID_KEY))
            .size(text(SIZE_KEY))
            .dont_override_size(lookup(DONT_OVERRIDE_TYPE_KEY).is_some_and(Scalar::flag))
            .count(integer(INSTANCES_KEY)?)
            .disk_size_gb(integer(DISK_KEY)?)
            .os(text(OS_KEY))
            .key_name(optional_text(KEYPAIR_NAME_KEY))
            .ssh_user(text(SSH_USER_KEY))
            .ssh_password(optional_text(SSH_PASS_KEY))
            .provider(optional_text(PROVIDER_KEY))
            .price_margin(price_margin);

        for (key, value) in entry {
            builder = builder.parameter(key, value.text());
        }
        builder.build()
    }
}
