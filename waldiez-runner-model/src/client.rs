use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse-grained permission scope carried in a token's `aud` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Audience {
    TasksApi,
    ClientsApi,
    Admin,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::TasksApi => "tasks-api",
            Audience::ClientsApi => "clients-api",
            Audience::Admin => "admin",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tasks-api" => Ok(Audience::TasksApi),
            "clients-api" => Ok(Audience::ClientsApi),
            "admin" => Ok(Audience::Admin),
            _ => Err(()),
        }
    }
}

/// A registered API client. Referenced by admission to attribute tasks;
/// client management itself happens outside the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub client_id: String,
    /// Hashed secret, never the plaintext.
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub audience: Audience,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_round_trips() {
        for audience in
            [Audience::TasksApi, Audience::ClientsApi, Audience::Admin]
        {
            assert_eq!(
                audience.as_str().parse::<Audience>().unwrap(),
                audience
            );
        }
        assert!("other".parse::<Audience>().is_err());
    }
}
