use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::stage::Stage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Education {
    pub school: String,
    pub degree: String,
    #[serde(default)]
    pub major: Option<String>,
}

impl Education {
    pub fn summary(&self) -> String {
        match &self.major {
            Some(major) if !major.trim().is_empty() => {
                format!("{} in {}, {}", self.degree, major, self.school)
            }
            _ => format!("{}, {}", self.degree, self.school),
        }
    }
}

/// Resolved profile handed to the pipeline. Owned by the profile store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub education: Vec<Education>,
}

impl UserProfile {
    /// Non-blank preferences in declared order, capped at `limit`.
    pub fn active_preferences(&self, limit: usize) -> Vec<String> {
        self.preferences
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .take(limit)
            .map(str::to_string)
            .collect()
    }

    pub fn city(&self) -> Option<&str> {
        self.city.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// A search hit that has not yet been verified as a job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub employment_type: String,
    pub remote_type: String,
    pub salary_min: i64,
    pub salary_max: i64,
    pub currency: String,
    pub description: String,
    pub ai_summary: String,
    pub skills: Vec<String>,
    pub responsibilities: Vec<String>,
    pub qualifications: Vec<String>,
    pub source_url: String,
    pub posted_at: Option<String>,
    pub match_score: u8,
    pub stage: Stage,
    pub note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Insert payload for `job_postings`; the store assigns id and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewJobPosting {
    pub user_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub employment_type: String,
    pub remote_type: String,
    pub salary_min: i64,
    pub salary_max: i64,
    pub currency: String,
    pub description: String,
    pub ai_summary: String,
    pub skills: Vec<String>,
    pub responsibilities: Vec<String>,
    pub qualifications: Vec<String>,
    pub source_url: String,
    pub posted_at: Option<String>,
    pub match_score: u8,
    pub stage: Stage,
}

impl NewJobPosting {
    pub fn key(&self) -> PostingKey<'_> {
        PostingKey {
            user_id: &self.user_id,
            title: &self.title,
            company: &self.company,
            source_url: &self.source_url,
        }
    }
}

/// The (user, title, company, url) tuple that identifies a stored posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingKey<'a> {
    pub user_id: &'a str,
    pub title: &'a str,
    pub company: &'a str,
    pub source_url: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_preferences_caps_and_skips_blank() {
        let profile = UserProfile {
            id: "u1".to_string(),
            preferences: vec![
                "Backend Engineer".to_string(),
                "  ".to_string(),
                " Data Engineer ".to_string(),
                "SRE".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(
            profile.active_preferences(2),
            vec!["Backend Engineer".to_string(), "Data Engineer".to_string()]
        );
    }

    #[test]
    fn test_profile_deserializes_with_missing_fields() {
        let profile: UserProfile = serde_json::from_str(r#"{"id": "u7"}"#).unwrap();
        assert!(profile.skills.is_empty());
        assert!(profile.preferences.is_empty());
        assert_eq!(profile.city(), None);
    }

    #[test]
    fn test_education_summary() {
        let edu = Education {
            school: "State University".to_string(),
            degree: "BSc".to_string(),
            major: Some("Computer Science".to_string()),
        };
        assert_eq!(edu.summary(), "BSc in Computer Science, State University");

        let edu = Education {
            major: None,
            ..edu
        };
        assert_eq!(edu.summary(), "BSc, State University");
    }
}
