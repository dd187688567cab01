//! Campaign expansion.
//!
//! Turns a bot roster, a map roster and a repeat count into the full job
//! list. Generation is pure: nothing is published here.

use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::CampaignError;
use crate::scheduler::Job;

use super::roster::dedup;

/// Default number of rounds over the whole pairing.
pub const DEFAULT_REPEAT_GAMES: usize = 10;

/// How bots are paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Every unordered pair of distinct bots.
    AllVsAll,
    /// One bot against every other bot.
    OneVsAll { test_bot: String },
}

/// Inputs of one campaign.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub bots: Vec<String>,
    pub maps: Vec<String>,
    pub repeat_games: usize,
    /// Set for one-vs-all campaigns.
    pub test_bot: Option<String>,
    /// Fixes the pair shuffle and the job id prefixes.
    pub seed: Option<u64>,
}

impl CampaignConfig {
    pub fn new(
        bots: impl IntoIterator<Item = impl Into<String>>,
        maps: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            bots: dedup(bots),
            maps: dedup(maps),
            repeat_games: DEFAULT_REPEAT_GAMES,
            test_bot: None,
            seed: None,
        }
    }

    pub fn with_repeat_games(mut self, repeat: usize) -> Self {
        self.repeat_games = repeat;
        self
    }

    pub fn with_test_bot(mut self, bot: impl Into<String>) -> Self {
        self.test_bot = Some(bot.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn policy(&self) -> Policy {
        match self.test_bot {
            Some(ref bot) => Policy::OneVsAll {
                test_bot: bot.clone(),
            },
            None => Policy::AllVsAll,
        }
    }

    /// Bots the test bot plays against. The test bot itself is excluded.
    pub fn opponents(&self) -> Vec<String> {
        match self.test_bot {
            Some(ref test_bot) => self
                .bots
                .iter()
                .filter(|b| *b != test_bot)
                .cloned()
                .collect(),
            None => self.bots.clone(),
        }
    }

    /// Every bot a job of this campaign may reference.
    pub fn all_bots(&self) -> Vec<String> {
        let mut bots = self.opponents();
        if let Some(ref test_bot) = self.test_bot {
            bots.push(test_bot.clone());
        }
        bots
    }

    /// Number of jobs `generate` produces.
    pub fn job_count(&self) -> usize {
        let pairings = match self.test_bot {
            Some(_) => self.opponents().len(),
            None => {
                let b = self.bots.len();
                b * b.saturating_sub(1) / 2
            }
        };
        pairings * self.maps.len() * self.repeat_games
    }

    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.maps.is_empty() {
            return Err(CampaignError::InvalidRoster("map roster is empty".to_string()));
        }
        if self.repeat_games == 0 {
            return Err(CampaignError::InvalidRoster(
                "repeat count must be at least 1".to_string(),
            ));
        }
        if self.bots.iter().chain(&self.maps).any(|n| n.is_empty()) {
            return Err(CampaignError::InvalidRoster("empty name in roster".to_string()));
        }
        match self.test_bot {
            Some(ref bot) if bot.is_empty() => {
                Err(CampaignError::InvalidRoster("test bot name is empty".to_string()))
            }
            Some(_) if self.opponents().is_empty() => Err(CampaignError::InvalidRoster(
                "one-vs-all needs at least one other bot".to_string(),
            )),
            None if self.bots.len() < 2 => Err(CampaignError::InvalidRoster(
                "all-vs-all needs at least two bots".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    /// Expands the campaign into its jobs, in publish order.
    pub fn generate(&self) -> Result<Vec<Job>, CampaignError> {
        self.validate()?;
        let mut rng = self.rng();

        let jobs = match self.test_bot {
            Some(ref test_bot) => {
                one_vs_all(test_bot, &self.opponents(), &self.maps, self.repeat_games, &mut rng)
            }
            None => all_vs_all(&self.bots, &self.maps, self.repeat_games, &mut rng),
        };
        Ok(jobs)
    }
}

/// Pairs are shuffled once; each round then walks maps outer, pairs inner.
/// Ids are a zero-padded counter offset by the round.
fn all_vs_all(bots: &[String], maps: &[String], repeat: usize, rng: &mut ChaCha8Rng) -> Vec<Job> {
    let mut pairs = Vec::with_capacity(bots.len() * bots.len().saturating_sub(1) / 2);
    for (i, bot_a) in bots.iter().enumerate() {
        for bot_b in &bots[i + 1..] {
            pairs.push((bot_a, bot_b));
        }
    }
    pairs.shuffle(rng);

    let per_round = pairs.len() * maps.len();
    let mut jobs = Vec::with_capacity(per_round * repeat);

    for round in 0..repeat {
        let mut k = 0;
        for map in maps {
            for (bot_a, bot_b) in &pairs {
                let job_id = format!("{:06}", round * per_round + k);
                jobs.push(Job::new([bot_a.as_str(), bot_b.as_str()], map.as_str(), job_id));
                k += 1;
            }
        }
    }

    jobs
}

/// Ids are a random hex prefix plus a monotonic suffix.
fn one_vs_all(
    test_bot: &str,
    opponents: &[String],
    maps: &[String],
    repeat: usize,
    rng: &mut ChaCha8Rng,
) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(opponents.len() * maps.len() * repeat);
    let mut n = 0;

    for _ in 0..repeat {
        for other in opponents {
            for map in maps {
                let prefix: u32 = rng.random();
                let job_id = format!("{:08X}_{:06}", prefix, n);
                jobs.push(Job::new([test_bot, other.as_str()], map.as_str(), job_id));
                n += 1;
            }
        }
    }

    jobs
}
