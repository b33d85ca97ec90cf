use tracing::info;

use crate::config::SelectionConfig;
use crate::model::{FinalSelection, Grade, SelectionMetadata, StrategyJudgment};

pub fn composite_score(judgment: &StrategyJudgment, config: &SelectionConfig) -> f64 {
    let quality = judgment.total / 100.0;
    let speed = (1.0 - judgment.speed_ms_per_page / config.speed_reference_ms_per_page).max(0.0);
    config.quality_weight * quality + config.speed_weight * speed
}

/// Judgments eligible for selection: every `pass`, else every `borderline`,
/// else all of them.
pub fn candidate_pool(judgments: &[StrategyJudgment]) -> Vec<&StrategyJudgment> {
    for grade in [Grade::Pass, Grade::Borderline] {
        let pool = judgments
            .iter()
            .filter(|judgment| judgment.grade == grade)
            .collect::<Vec<&StrategyJudgment>>();
        if !pool.is_empty() {
            return pool;
        }
    }
    judgments.iter().collect()
}

/// Picks the strategy with the best composite score. When other candidates
/// sit within `tie_margin` total points of it, the fastest of that group wins.
/// Returns `None` only when there is nothing to choose from.
pub fn select(
    document: &str,
    judgments: &[StrategyJudgment],
    config: &SelectionConfig,
) -> Option<FinalSelection> {
    let pool = candidate_pool(judgments);
    let best = pool.iter().copied().max_by(|left, right| {
        composite_score(left, config).total_cmp(&composite_score(right, config))
    })?;

    let tied = pool
        .iter()
        .copied()
        .filter(|judgment| (judgment.total - best.total).abs() < config.tie_margin)
        .collect::<Vec<&StrategyJudgment>>();
    let tie_break_applied = tied.len() > 1;
    let chosen = if tie_break_applied {
        tied.iter()
            .copied()
            .min_by(|left, right| left.speed_ms_per_page.total_cmp(&right.speed_ms_per_page))
            .unwrap_or(best)
    } else {
        best
    };

    let mut rationale = format!(
        "Total quality {:.1}/100 ({}), processing speed {:.0} ms/page.",
        chosen.total, chosen.grade, chosen.speed_ms_per_page
    );
    if !chosen.fallback_tools.is_empty() {
        let tools = chosen
            .fallback_tools
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<&str>>()
            .join(", ");
        rationale.push_str(&format!(" Fallback tools used: {tools}."));
    }
    if tie_break_applied {
        rationale.push_str(&format!(
            " Tie-break: {} strategies scored within {:.1} points, the fastest was chosen.",
            tied.len(),
            config.tie_margin
        ));
    }

    let composite = composite_score(chosen, config);
    info!(
        document,
        strategy = %chosen.strategy,
        total = chosen.total,
        composite,
        candidates = pool.len(),
        tie_break_applied,
        "strategy selected"
    );

    Some(FinalSelection {
        document: document.to_string(),
        strategy: chosen.strategy.clone(),
        total: chosen.total,
        speed_ms_per_page: chosen.speed_ms_per_page,
        rationale,
        metadata: SelectionMetadata {
            candidate_count: judgments.len(),
            pass_count: judgments
                .iter()
                .filter(|judgment| judgment.grade == Grade::Pass)
                .count(),
            composite_score: composite,
            tie_break_applied,
        },
    })
}
