//! Chain resolution driven by a full configuration document

use serde_json::json;
use statline_common::config::StatlineConfig;
use statline_core::resolver::mock::{call_log, Behavior, ScriptedExtractor};
use statline_core::types::{ExtractionContext, QualityTier};
use statline_core::{ExtractorSet, FallbackChainResolver, ResolveError};

const CONFIG: &str = r#"
version = 1

[resolver]
extractor_timeout_ms = 100

[scoring]
placeholder_baseline = 0
degraded_baseline = 30

[scoring.issue_penalties]
estimated_possessions = 10
missing_plus_minus = 4

[[sources]]
id = "nbac"
weight = 100
tier = "primary"

[[sources]]
id = "reconstruct"
weight = 85
tier = "derived"

[[sources]]
id = "espn"
weight = 80
tier = "secondary"

[[sources]]
id = "bdl"
weight = 70
tier = "secondary"
timeout_ms = 20

[[chains]]
name = "team_boxscores"
sources = ["nbac", "reconstruct", "espn"]
exhaustion = { policy = "fail" }

[[chains]]
name = "player_boxscores"
sources = ["bdl", "espn"]
exhaustion = { policy = "continue_with_penalty", penalty = 15 }

[[chains]]
name = "injury_reports"
sources = ["espn"]
exhaustion = { policy = "skip" }

[[chains]]
name = "player_tracking"
sources = ["bdl", "nbac"]
exhaustion = { policy = "continue_with_penalty", penalty = 0 }
"#;

fn resolver() -> FallbackChainResolver {
    let config = StatlineConfig::from_toml_str(CONFIG).unwrap();
    FallbackChainResolver::from_config(&config).unwrap()
}

fn ctx(key: &str) -> ExtractionContext {
    ExtractionContext::new(key).with_param("season", "2025-26")
}

#[tokio::test]
async fn test_reconstruct_fallback_scores_silver() {
    let extractors = ExtractorSet::new()
        .with("nbac", ScriptedExtractor::new("nbac", Behavior::Empty))
        .with(
            "reconstruct",
            ScriptedExtractor::new(
                "reconstruct",
                Behavior::Rows {
                    payload: json!([{"team": "LAL", "possessions": 101.4}]),
                    issues: vec!["estimated_possessions".to_string()],
                },
            ),
        )
        .with("espn", ScriptedExtractor::rows("espn", json!([{"team": "LAL"}])));

    let scored = resolver()
        .resolve_scored("team_boxscores", &extractors, &ctx("0022500301"))
        .await
        .unwrap();

    assert_eq!(scored.extraction.source_used(), Some("reconstruct"));
    assert_eq!(scored.quality.score, 75);
    assert_eq!(scored.quality.tier, QualityTier::Silver);
    assert_eq!(scored.quality.confidence_cap, 95);
    assert!(scored.quality.prediction_eligible);
}

#[tokio::test]
async fn test_sources_attempted_in_declared_order() {
    let calls = call_log();
    let extractors = ExtractorSet::new()
        .with("espn", ScriptedExtractor::failing("espn").recording(&calls))
        .with("reconstruct", ScriptedExtractor::failing("reconstruct").recording(&calls))
        .with("nbac", ScriptedExtractor::failing("nbac").recording(&calls));

    let err = resolver()
        .resolve("team_boxscores", &extractors, &ctx("0022500301"))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::ChainExhausted { .. }));
    assert_eq!(*calls.lock().unwrap(), vec!["nbac", "reconstruct", "espn"]);
}

#[tokio::test]
async fn test_per_source_timeout_override() {
    let extractors = ExtractorSet::new()
        .with("bdl", ScriptedExtractor::new("bdl", Behavior::Hang))
        .with("espn", ScriptedExtractor::rows("espn", json!([{"player": "tatum"}])));

    let result = resolver()
        .resolve("player_boxscores", &extractors, &ctx("0022500301"))
        .await
        .unwrap();

    assert_eq!(result.source_used(), Some("espn"));
    assert_eq!(result.failures[0].source, "bdl");
    assert_eq!(result.quality_issues[0], "source_failed:bdl:timed out after 20 ms");
}

#[tokio::test]
async fn test_skip_chain_all_failing() {
    let extractors =
        ExtractorSet::new().with("espn", ScriptedExtractor::new("espn", Behavior::Empty));

    let scored = resolver()
        .resolve_scored("injury_reports", &extractors, &ctx("2025-11-28"))
        .await
        .unwrap();

    assert!(scored.extraction.should_skip());
    assert_eq!(scored.extraction.source_used(), None);
    assert_eq!(scored.quality.tier, QualityTier::Unusable);
}

#[tokio::test]
async fn test_degraded_without_partial_uses_baseline_minus_penalty() {
    let extractors = ExtractorSet::new()
        .with("bdl", ScriptedExtractor::failing("bdl"))
        .with("espn", ScriptedExtractor::failing("espn"));

    let scored = resolver()
        .resolve_scored("player_boxscores", &extractors, &ctx("0022500301"))
        .await
        .unwrap();

    assert!(scored.extraction.is_degraded());
    assert_eq!(scored.quality.score, 15);
    assert!(!scored.quality.prediction_eligible);
}

#[tokio::test]
async fn test_partial_data_from_top_source_stays_degraded() {
    let extractors = ExtractorSet::new()
        .with("bdl", ScriptedExtractor::failing("bdl"))
        .with(
            "nbac",
            ScriptedExtractor::new("nbac", Behavior::Partial(json!([{"player": "brown"}]))),
        );

    let scored = resolver()
        .resolve_scored("player_tracking", &extractors, &ctx("0022500301"))
        .await
        .unwrap();

    assert!(scored.extraction.is_degraded());
    assert_eq!(scored.extraction.payload, json!([{"player": "brown"}]));
    assert_eq!(scored.quality.score, 30);
    assert_eq!(scored.quality.tier, QualityTier::Unusable);
    assert!(!scored.quality.prediction_eligible);
}

#[tokio::test]
async fn test_concurrent_resolutions_are_independent() {
    let resolver = std::sync::Arc::new(resolver());

    let mut tasks = Vec::new();
    for game in 0..16u32 {
        let resolver = resolver.clone();
        tasks.push(tokio::spawn(async move {
            let nbac = if game % 2 == 0 {
                ScriptedExtractor::rows("nbac", json!([{"game": game}]))
            } else {
                ScriptedExtractor::failing("nbac")
            };
            let extractors = ExtractorSet::new()
                .with("nbac", nbac)
                .with("reconstruct", ScriptedExtractor::rows("reconstruct", json!([{"game": game}])))
                .with("espn", ScriptedExtractor::failing("espn"));

            let scored = resolver
                .resolve_scored("team_boxscores", &extractors, &ctx(&format!("game-{}", game)))
                .await
                .unwrap();
            (game, scored)
        }));
    }

    for task in futures::future::join_all(tasks).await {
        let (game, scored) = task.unwrap();
        let expected = if game % 2 == 0 { "nbac" } else { "reconstruct" };
        assert_eq!(scored.extraction.source_used(), Some(expected));
        assert_eq!(scored.extraction.payload, json!([{"game": game}]));
        assert_eq!(scored.extraction.data_unit_key, format!("game-{}", game));
    }
}
