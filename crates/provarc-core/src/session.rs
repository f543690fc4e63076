//! # Session Module
//!
//! A session ties a [`Profile`] to the two resources it names: the redb
//! record store and the payload repository. Every export and import entry
//! point takes a session; none of them reach for ambient state.

use crate::config::Profile;
use crate::primitives::{COMPUTER_TYPE, GROUP_TYPE, NODE_TYPE, USER_TYPE};
use crate::storage::{Repository, Store};
use crate::types::ProvarcError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use tracing::info;

/// Record counts of a store, for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub records: BTreeMap<String, usize>,
    pub links: u64,
    pub payloads: usize,
}

/// An opened store and repository, plus the profile they came from.
#[derive(Debug)]
pub struct Session {
    profile: Profile,
    store: Store,
    repository: Repository,
}

impl Session {
    /// Open (creating if needed) the store and repository named by `profile`.
    pub fn open(profile: Profile) -> Result<Self, ProvarcError> {
        profile.validate()?;
        if let Some(parent) = profile
            .database
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .map_err(|e| ProvarcError::Io(format!("{}: {}", parent.display(), e)))?;
        }
        let store = Store::open_standard(&profile.database)?;
        let repository = Repository::open(&profile.repository)?;
        info!(
            database = %profile.database.display(),
            repository = %profile.repository.display(),
            "session opened"
        );
        Ok(Self {
            profile,
            store,
            repository,
        })
    }

    #[must_use]
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Count records per independently addressable type, links and payloads.
    pub fn status(&self) -> Result<StoreStatus, ProvarcError> {
        let reader = self.store.begin_read()?;
        let mut records = BTreeMap::new();
        for entity_type in [USER_TYPE, COMPUTER_TYPE, NODE_TYPE, GROUP_TYPE] {
            records.insert(entity_type.to_string(), reader.count(entity_type)?);
        }
        Ok(StoreStatus {
            records,
            links: reader.link_count()?,
            payloads: self.repository.list()?.len(),
        })
    }
}
