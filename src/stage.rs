use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::db::{Database, InsertOutcome};
use crate::models::{JobPosting, NewJobPosting};

/// Where a posting sits in the user's tracking workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Default,
    Wishlist,
    Applied,
    Interview,
    Offer,
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Default,
        Stage::Wishlist,
        Stage::Applied,
        Stage::Interview,
        Stage::Offer,
        Stage::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Default => "DEFAULT",
            Stage::Wishlist => "WISHLIST",
            Stage::Applied => "APPLIED",
            Stage::Interview => "INTERVIEW",
            Stage::Offer => "OFFER",
            Stage::Rejected => "REJECTED",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Default => "Discovered",
            Stage::Wishlist => "Wishlist",
            Stage::Applied => "Applied",
            Stage::Interview => "Interviewing",
            Stage::Offer => "Offer",
            Stage::Rejected => "Rejected",
        }
    }

    /// Stages reachable from `self` in one user action.
    pub fn allowed_next(&self) -> &'static [Stage] {
        match self {
            Stage::Default => &[Stage::Wishlist, Stage::Applied],
            Stage::Wishlist => &[Stage::Default, Stage::Applied],
            Stage::Applied | Stage::Interview | Stage::Offer => {
                &[Stage::Applied, Stage::Interview, Stage::Offer]
            }
            Stage::Rejected => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    pub fn can_transition_to(&self, to: Stage) -> bool {
        self.allowed_next().contains(&to)
    }

    pub fn validate_transition(&self, to: Stage) -> Result<(), StageError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(StageError::InvalidTransition { from: *self, to })
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown stage '{0}' (expected one of DEFAULT, WISHLIST, APPLIED, INTERVIEW, OFFER, REJECTED)")]
pub struct ParseStageError(String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

/// Errors surfaced to the user from stage operations.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("job posting #{posting_id} not found")]
    NotFound { posting_id: i64 },

    #[error("cannot move a posting from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("job posting #{posting_id} was changed by another request, try again")]
    Conflict { posting_id: i64 },

    #[error("posting already tracked as #{posting_id}")]
    AlreadyTracked { posting_id: i64 },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Tells dependent read views that a user's posting changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInvalidation {
    pub user_id: String,
    pub posting_id: i64,
    pub stage: Option<Stage>,
}

/// User-initiated mutations on stored postings.
pub struct StageService {
    db: Arc<Database>,
    invalidations: broadcast::Sender<ViewInvalidation>,
}

impl StageService {
    pub fn new(db: Arc<Database>) -> Self {
        let (invalidations, _) = broadcast::channel(64);
        Self { db, invalidations }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn subscribe(&self) -> broadcast::Receiver<ViewInvalidation> {
        self.invalidations.subscribe()
    }

    pub fn transition(&self, user_id: &str, posting_id: i64, to: Stage) -> Result<JobPosting, StageError> {
        let mut posting = self.owned_posting(user_id, posting_id)?;
        posting.stage.validate_transition(to)?;

        if !self.db.update_stage(posting_id, posting.stage, to)? {
            // Someone else moved it after we read it; judge the move against the new stage
            let current = self.owned_posting(user_id, posting_id)?;
            current.stage.validate_transition(to)?;
            return Err(StageError::Conflict { posting_id });
        }
        info!(user_id, posting_id, from = %posting.stage, to = %to, "Stage changed");
        posting.stage = to;

        self.invalidate(user_id, posting_id, Some(to));
        Ok(posting)
    }

    /// Tracks an externally found job directly in WISHLIST.
    pub fn wishlist(&self, mut posting: NewJobPosting) -> Result<i64, StageError> {
        posting.stage = Stage::Wishlist;
        match self.db.insert_posting(&posting)? {
            InsertOutcome::Inserted(id) => {
                info!(user_id = %posting.user_id, posting_id = id, "Wishlisted job");
                self.invalidate(&posting.user_id, id, Some(Stage::Wishlist));
                Ok(id)
            }
            InsertOutcome::Duplicate => {
                let posting_id = self.db.find_by_key(&posting.key())?.unwrap_or_default();
                Err(StageError::AlreadyTracked { posting_id })
            }
        }
    }

    pub fn set_note(&self, user_id: &str, posting_id: i64, note: Option<&str>) -> Result<(), StageError> {
        self.owned_posting(user_id, posting_id)?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        self.db.set_note(posting_id, note)?;
        self.invalidate(user_id, posting_id, None);
        Ok(())
    }

    pub fn delete(&self, user_id: &str, posting_id: i64) -> Result<(), StageError> {
        self.owned_posting(user_id, posting_id)?;
        self.db.delete_posting(posting_id)?;
        info!(user_id, posting_id, "Deleted posting");
        self.invalidate(user_id, posting_id, None);
        Ok(())
    }

    fn owned_posting(&self, user_id: &str, posting_id: i64) -> Result<JobPosting, StageError> {
        self.db
            .get_posting(posting_id)?
            .filter(|p| p.user_id == user_id)
            .ok_or(StageError::NotFound { posting_id })
    }

    fn invalidate(&self, user_id: &str, posting_id: i64, stage: Option<Stage>) {
        // No subscribers is fine; views pick the change up on their next read
        let _ = self.invalidations.send(ViewInvalidation {
            user_id: user_id.to_string(),
            posting_id,
            stage,
        });
    }
}
