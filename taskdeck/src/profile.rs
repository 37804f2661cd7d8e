//! Editing of the principal's profile.
//!
//! The full name goes through a two-phase edit: [`ProfileEditor::begin_edit`]
//! copies the committed name into a draft, and the draft only replaces the
//! committed name once the store confirms [`ProfileEditor::commit_edit`]. A failed
//! commit keeps the editor in [`EditMode::Editing`] with the draft intact. The
//! avatar is not part of that flow; it is written immediately.

use std::sync::Arc;

use thiserror::Error;

use crate::auth::Principal;
use crate::messages::{OwnerId, Profile, ProfilePatch, normalize_text};
use crate::store::{RemoteStore, StoreError};

const ANONYMOUS_NAME: &str = "Anonymous User";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Profile is not being edited")]
    NotEditing,

    #[error("Remote call failed: {0}")]
    Remote(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditMode {
    Viewing,
    Editing { draft: String },
}

pub struct ProfileEditor {
    store: Arc<dyn RemoteStore>,
    owner: OwnerId,
    email: Option<String>,
    profile: Profile,
    mode: EditMode,
    last_error: Option<String>,
}

impl ProfileEditor {
    /// Fetch the profile of `principal`, creating it if absent.
    ///
    /// A new profile is seeded with the principal's full name, if known.
    pub async fn load(
        store: Arc<dyn RemoteStore>,
        principal: &Principal,
    ) -> Result<Self, ProfileError> {
        let profile = match store.fetch_profile(&principal.id).await? {
            Some(profile) => profile,
            None => {
                log::info!("Creating profile for {}", principal.id);
                store
                    .insert_profile(
                        &principal.id,
                        normalize_text(principal.full_name.as_deref()),
                    )
                    .await?
            }
        };
        Ok(Self {
            store,
            owner: principal.id,
            email: principal.email.clone(),
            profile,
            mode: EditMode::Viewing,
            last_error: None,
        })
    }

    /// The committed profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn mode(&self) -> &EditMode {
        &self.mode
    }

    pub fn is_editing(&self) -> bool {
        matches!(self.mode, EditMode::Editing { .. })
    }

    pub fn draft(&self) -> Option<&str> {
        match &self.mode {
            EditMode::Editing { draft } => Some(draft),
            EditMode::Viewing => None,
        }
    }

    /// Message of the last failed remote call, until the next success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn display_name(&self) -> &str {
        display_name(&self.profile)
    }

    pub fn avatar_initial(&self) -> Option<char> {
        avatar_initial(&self.profile, self.email.as_deref())
    }

    /// Enter edit mode with the committed name as draft. No-op while editing.
    pub fn begin_edit(&mut self) {
        if !self.is_editing() {
            self.mode = EditMode::Editing {
                draft: self.profile.full_name.clone().unwrap_or_default(),
            };
        }
    }

    pub fn set_draft(&mut self, value: impl Into<String>) -> Result<(), ProfileError> {
        match &mut self.mode {
            EditMode::Editing { draft } => {
                *draft = value.into();
                Ok(())
            }
            EditMode::Viewing => Err(ProfileError::NotEditing),
        }
    }

    /// Discard the draft. Never touches the store.
    pub fn cancel_edit(&mut self) {
        self.mode = EditMode::Viewing;
    }

    /// Write the draft. On success the draft becomes the committed name and the
    /// editor returns to viewing; on failure it stays in edit mode.
    pub async fn commit_edit(&mut self) -> Result<(), ProfileError> {
        let EditMode::Editing { draft } = &self.mode else {
            return Err(ProfileError::NotEditing);
        };
        let full_name = normalize_text(Some(draft.as_str()));

        let patch = ProfilePatch::full_name(full_name.as_deref());
        if let Err(e) = self.store.update_profile(&self.owner, patch).await {
            log::error!("Failed to update profile of {}: {e}", self.owner);
            self.last_error = Some(e.to_string());
            return Err(ProfileError::Remote(e));
        }

        self.profile.full_name = full_name;
        self.mode = EditMode::Viewing;
        self.last_error = None;
        Ok(())
    }

    /// Point the profile at a new avatar reference. Applied once the store confirms.
    pub async fn set_avatar_reference(&mut self, reference: &str) -> Result<(), ProfileError> {
        let patch = ProfilePatch::avatar_url(reference);
        if let Err(e) = self.store.update_profile(&self.owner, patch).await {
            log::error!("Failed to set avatar of {}: {e}", self.owner);
            self.last_error = Some(e.to_string());
            return Err(ProfileError::Remote(e));
        }
        self.profile.avatar_url = Some(reference.to_string());
        self.last_error = None;
        Ok(())
    }

    /// Upload `bytes` as the new avatar and reference it from the profile.
    ///
    /// The extension is taken from `file_name`. Returns the public reference.
    pub async fn upload_avatar(
        &mut self,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<String, ProfileError> {
        if bytes.is_empty() {
            return Err(ProfileError::Validation(
                "You must select an image to upload.".into(),
            ));
        }
        let extension = file_extension(file_name).ok_or_else(|| {
            ProfileError::Validation(format!("`{file_name}` has no file extension"))
        })?;

        let reference = match self.store.upload_avatar(&self.owner, bytes, &extension).await {
            Ok(reference) => reference,
            Err(e) => {
                log::error!("Failed to upload avatar of {}: {e}", self.owner);
                self.last_error = Some(e.to_string());
                return Err(ProfileError::Remote(e));
            }
        };
        self.set_avatar_reference(&reference).await?;
        Ok(reference)
    }
}

/// Full name, or a placeholder when none is set.
pub fn display_name(profile: &Profile) -> &str {
    profile.full_name.as_deref().unwrap_or(ANONYMOUS_NAME)
}

/// First letter of the name, else of the email, upper-cased.
pub fn avatar_initial(profile: &Profile, email: Option<&str>) -> Option<char> {
    profile
        .full_name
        .as_deref()
        .and_then(|name| name.chars().next())
        .or_else(|| email.and_then(|email| email.chars().next()))
        .and_then(|c| c.to_uppercase().next())
}

fn file_extension(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}
