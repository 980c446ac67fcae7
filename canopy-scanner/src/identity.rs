use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const DEFAULT_LANGUAGES: &[&str] = &[
    "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7",
    "fr-FR,fr;q=0.9,en;q=0.8",
    "en-US,en;q=0.9,fr;q=0.8",
];

/// Outbound request fingerprint: one user agent plus the headers sent with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_agent: String,
    pub accept_language: String,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

impl Identity {
    pub fn new(user_agent: impl Into<String>, accept_language: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept_language: accept_language.into(),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Default headers for a reqwest client. Headers that are not valid HTTP
    /// are skipped with a warning.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.accept_language) {
            headers.insert(ACCEPT_LANGUAGE, value);
        }

        for (name, value) in &self.extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("Skipping invalid identity header '{}'", name),
            }
        }

        headers
    }

    /// Headers for a browser session, minus the user agent which Chrome takes
    /// through its own override call.
    pub fn browser_headers(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "Accept-Language".to_string(),
            serde_json::Value::String(self.accept_language.clone()),
        );
        for (name, value) in &self.extra_headers {
            map.insert(name.clone(), serde_json::Value::String(value.clone()));
        }
        serde_json::Value::Object(map)
    }
}

/// The rotation set: every user agent combined with every language profile.
pub fn default_identities() -> Vec<Identity> {
    DEFAULT_USER_AGENTS
        .iter()
        .flat_map(|ua| {
            DEFAULT_LANGUAGES
                .iter()
                .map(move |lang| Identity::new(*ua, *lang))
        })
        .collect()
}

/// Assigns one identity per worker, once, at construction.
///
/// With a seed the assignment is reproducible; without one each worker gets a
/// uniform random pick from the rotation set.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    profiles: Vec<Identity>,
    assignments: Vec<usize>,
}

impl IdentityPool {
    pub fn new(profiles: Vec<Identity>, workers: usize, seed: Option<u64>) -> Self {
        let profiles = if profiles.is_empty() {
            default_identities()
        } else {
            profiles
        };

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let assignments = (0..workers)
            .map(|_| rng.random_range(0..profiles.len()))
            .collect::<Vec<_>>();

        debug!("Identity pool: {} profiles for {} workers", profiles.len(), workers);

        Self {
            profiles,
            assignments,
        }
    }

    pub fn with_defaults(workers: usize, seed: Option<u64>) -> Self {
        Self::new(default_identities(), workers, seed)
    }

    /// Identity of a worker. Ids past the configured worker count wrap around
    /// the assignment table so the lookup never fails.
    pub fn identity_for(&self, worker_id: usize) -> &Identity {
        let index = if self.assignments.is_empty() {
            worker_id % self.profiles.len()
        } else {
            self.assignments[worker_id % self.assignments.len()]
        };
        &self.profiles[index]
    }

    pub fn profiles(&self) -> &[Identity] {
        &self.profiles
    }

    pub fn workers(&self) -> usize {
        self.assignments.len()
    }
}
