use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

use crate::agent::providers::RemoteModel;
use crate::config::RoutingConfig;
use crate::store::canonical_cmp;
use crate::types::Persona;

/// Where a relevance score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSource {
    Remote,
    Keywords,
}

#[derive(Debug, Clone)]
pub struct ScoredPersona {
    pub persona: Persona,
    pub score: f64,
    pub source: ScoreSource,
}

/// Which personas answer an unaddressed message.
#[derive(Debug, Clone, Default)]
pub struct RouteDecision {
    /// Replies immediately.
    pub main: Option<ScoredPersona>,
    /// Reply after a delay, in short mode.
    pub secondary: Vec<ScoredPersona>,
}

impl RouteDecision {
    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.secondary.is_empty()
    }
}

/// Fraction of the persona's keywords that occur in `text`, case-insensitively.
///
/// Zero keywords always score 0. Blank keywords never match but still count
/// toward the total.
pub fn keyword_relevance(keywords: &[String], text: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let text = text.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|kw| !kw.is_empty() && text.contains(&kw.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Non-finite scores are unusable; finite ones are clamped into `[0, 1]`.
fn usable_score(score: Option<f64>) -> Option<f64> {
    score.filter(|s| s.is_finite()).map(|s| s.clamp(0.0, 1.0))
}

/// Decides main and secondary responders for ambient messages.
pub struct RelevanceRouter {
    model: Option<Arc<dyn RemoteModel>>,
    config: RoutingConfig,
}

impl RelevanceRouter {
    pub fn new(model: Option<Arc<dyn RemoteModel>>, config: RoutingConfig) -> Self {
        Self { model, config }
    }

    /// Score one persona: remote first, keyword overlap otherwise.
    pub async fn score(&self, persona: &Persona, text: &str) -> ScoredPersona {
        let remote = match &self.model {
            Some(model) => usable_score(model.score_relevance(persona, text).await),
            None => None,
        };

        let (score, source) = match remote {
            Some(score) => (score, ScoreSource::Remote),
            None => (keyword_relevance(&persona.keywords, text), ScoreSource::Keywords),
        };
        debug!(persona = %persona.name, score, ?source, "scored persona");

        ScoredPersona {
            persona: persona.clone(),
            score,
            source,
        }
    }

    /// Score every persona concurrently. Output is in canonical order no
    /// matter which scorer finishes first.
    pub async fn score_all(&self, personas: &[Persona], text: &str) -> Vec<ScoredPersona> {
        let mut ordered: Vec<&Persona> = personas.iter().collect();
        ordered.sort_by(|a, b| canonical_cmp(a, b));
        join_all(ordered.into_iter().map(|p| self.score(p, text))).await
    }

    pub async fn route(&self, personas: &[Persona], text: &str) -> RouteDecision {
        let scored = self.score_all(personas, text).await;
        select(scored, &self.config)
    }
}

/// Pick responders from scores already in canonical order.
///
/// Main is the first persona at or above the main threshold. Secondary is
/// every other persona at or above the secondary threshold, capped.
pub fn select(scored: Vec<ScoredPersona>, config: &RoutingConfig) -> RouteDecision {
    let main_idx = scored.iter().position(|s| s.score >= config.main_threshold);

    let mut main = None;
    let mut secondary = Vec::new();
    for (idx, candidate) in scored.into_iter().enumerate() {
        if Some(idx) == main_idx {
            main = Some(candidate);
        } else if candidate.score >= config.secondary_threshold
            && secondary.len() < config.max_secondary
        {
            secondary.push(candidate);
        }
    }

    RouteDecision { main, secondary }
}
