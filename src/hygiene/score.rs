//! Cleanliness score computation.
//!
//! Five components (orphans, large files, dead code, notebook outputs,
//! secrets), each bucketed into a piecewise-constant curve in [0, 1] and
//! combined with the configured weights into a 0-100 score with a letter
//! grade.

use super::config::ScoreWeights;
use serde::{Deserialize, Serialize};

/// Raw counts feeding the score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentStats {
    pub orphans: usize,
    /// Non-whitelisted large files only.
    pub large_files: usize,
    pub dead_functions: usize,
    pub dead_types: usize,
    pub dead_imports: usize,
    pub notebooks_needing_cleanup: usize,
    pub secret_findings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub orphans: f64,
    pub large_files: f64,
    pub dead_code: f64,
    pub notebooks: f64,
    pub secrets: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanlinessScore {
    pub score: f64,
    pub grade: String,
    pub breakdown: ScoreBreakdown,
    pub weights: ScoreWeights,
}

/// Compute the weighted score, rounded to one decimal place.
pub fn compute_cleanliness_score(stats: ComponentStats, weights: &ScoreWeights) -> CleanlinessScore {
    let orphan_score = score_orphans(stats.orphans);
    let large_file_score = score_large_files(stats.large_files);
    let dead_code_score = score_dead_code(
        stats.dead_functions * 3 + stats.dead_types * 3 + stats.dead_imports,
    );
    let notebook_score = score_notebooks(stats.notebooks_needing_cleanup);
    let secrets_score = score_secrets(stats.secret_findings);

    let total = orphan_score * weights.no_orphans
        + large_file_score * weights.no_large_files
        + dead_code_score * weights.no_dead_code
        + notebook_score * weights.no_notebook_outputs
        + secrets_score * weights.no_secrets;
    let score = (total * 10.0).round() / 10.0;

    CleanlinessScore {
        score,
        grade: grade_for(score).to_string(),
        breakdown: ScoreBreakdown {
            orphans: orphan_score * 100.0,
            large_files: large_file_score * 100.0,
            dead_code: dead_code_score * 100.0,
            notebooks: notebook_score * 100.0,
            secrets: secrets_score * 100.0,
        },
        weights: weights.clone(),
    }
}

fn score_orphans(count: usize) -> f64 {
    match count {
        0 => 1.0,
        1..=5 => 0.8,
        6..=10 => 0.6,
        11..=20 => 0.4,
        21..=50 => 0.2,
        _ => 0.0,
    }
}

fn score_large_files(count: usize) -> f64 {
    match count {
        0 => 1.0,
        1..=3 => 0.7,
        4..=5 => 0.5,
        6..=10 => 0.3,
        _ => 0.0,
    }
}

fn score_dead_code(weighted_total: usize) -> f64 {
    match weighted_total {
        0 => 1.0,
        1..=10 => 0.8,
        11..=20 => 0.6,
        21..=50 => 0.4,
        _ => 0.2,
    }
}

fn score_notebooks(needs_cleanup: usize) -> f64 {
    match needs_cleanup {
        0 => 1.0,
        1..=2 => 0.7,
        3..=5 => 0.5,
        6..=10 => 0.3,
        _ => 0.0,
    }
}

fn score_secrets(findings: usize) -> f64 {
    // Any secret finding is a critical failure.
    if findings == 0 { 1.0 } else { 0.0 }
}

pub fn grade_for(score: f64) -> &'static str {
    if score >= 95.0 {
        "A+"
    } else if score >= 90.0 {
        "A"
    } else if score >= 85.0 {
        "B+"
    } else if score >= 80.0 {
        "B"
    } else if score >= 75.0 {
        "C+"
    } else if score >= 70.0 {
        "C"
    } else if score >= 60.0 {
        "D"
    } else {
        "F"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(stats: ComponentStats) -> CleanlinessScore {
        compute_cleanliness_score(stats, &ScoreWeights::default())
    }

    #[test]
    fn pristine_repository_scores_100() {
        let result = score(ComponentStats::default());
        assert_eq!(result.score, 100.0);
        assert_eq!(result.grade, "A+");
    }

    #[test]
    fn three_unused_functions_score_96() {
        // Dead-code weighted total 9 lands in the <=10 bucket (0.8):
        // 30 + 25 + 16 + 15 + 10 = 96.
        let result = score(ComponentStats {
            dead_functions: 3,
            ..Default::default()
        });
        assert!((result.score - 96.0).abs() < 0.1);
        assert_eq!(result.grade, "A+");
        assert!((result.breakdown.dead_code - 80.0).abs() < 0.1);
    }

    #[test]
    fn orphan_buckets_follow_the_curve() {
        for (count, expected) in [(0, 1.0), (3, 0.8), (8, 0.6), (15, 0.4), (40, 0.2), (60, 0.0)] {
            assert_eq!(score_orphans(count), expected, "orphans = {count}");
        }
    }

    #[test]
    fn large_file_buckets_follow_the_curve() {
        for (count, expected) in [(0, 1.0), (2, 0.7), (5, 0.5), (9, 0.3), (11, 0.0)] {
            assert_eq!(score_large_files(count), expected, "large files = {count}");
        }
    }

    #[test]
    fn notebook_buckets_follow_the_curve() {
        for (count, expected) in [(0, 1.0), (2, 0.7), (4, 0.5), (10, 0.3), (12, 0.0)] {
            assert_eq!(score_notebooks(count), expected, "notebooks = {count}");
        }
    }

    #[test]
    fn any_secret_zeroes_the_component() {
        let clean = score(ComponentStats::default());
        let leaked = score(ComponentStats {
            secret_findings: 1,
            ..Default::default()
        });
        assert_eq!(clean.score - leaked.score, 10.0);
        assert_eq!(leaked.breakdown.secrets, 0.0);
    }

    #[test]
    fn dead_code_weighs_items_over_imports() {
        // 2 functions + 1 type = 9 weighted; plus 2 imports = 11 -> next bucket.
        let light = score(ComponentStats {
            dead_functions: 2,
            dead_types: 1,
            ..Default::default()
        });
        let heavy = score(ComponentStats {
            dead_functions: 2,
            dead_types: 1,
            dead_imports: 2,
            ..Default::default()
        });
        assert!(heavy.score < light.score);
    }

    #[test]
    fn grade_thresholds() {
        assert_eq!(grade_for(95.0), "A+");
        assert_eq!(grade_for(94.9), "A");
        assert_eq!(grade_for(90.0), "A");
        assert_eq!(grade_for(87.0), "B+");
        assert_eq!(grade_for(82.0), "B");
        assert_eq!(grade_for(76.0), "C+");
        assert_eq!(grade_for(71.0), "C");
        assert_eq!(grade_for(65.0), "D");
        assert_eq!(grade_for(59.9), "F");
    }

    #[test]
    fn worst_case_scores_zero() {
        let result = score(ComponentStats {
            orphans: 100,
            large_files: 20,
            dead_functions: 100,
            dead_types: 0,
            dead_imports: 0,
            notebooks_needing_cleanup: 20,
            secret_findings: 5,
        });
        // Dead code floors at 0.2, everything else at 0.
        assert!((result.score - 4.0).abs() < 0.1);
        assert_eq!(result.grade, "F");
    }
}
