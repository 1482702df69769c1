use crate::models::features::DiffFeatureSummary;

const CODE_FILE_WEIGHT: f64 = 2.0;
const CODE_FILE_CAP: usize = 10;
const HUNK_WEIGHT: f64 = 0.8;
const HUNK_CAP: usize = 25;
const LANGUAGE_WEIGHT: f64 = 2.0;
const LANGUAGE_CAP: usize = 5;
const TEST_FILE_WEIGHT: f64 = 3.0;
const TEST_FILE_CAP: usize = 5;
const DOC_BONUS: f64 = 4.0;
const SIZE_WEIGHT: f64 = 40.0;
const SIZE_SCALE: f64 = 300.0;
const DEPENDENCY_RISK: f64 = 5.0;
const SECURITY_RISK: f64 = 6.0;
const RENAME_CAP: usize = 5;
const CODE_AND_TEST_BONUS: f64 = 6.0;
const COSMETIC_FILE_THRESHOLD: usize = 10;
const COSMETIC_HUNK_THRESHOLD: usize = 5;
const COSMETIC_PENALTY: f64 = 0.85;

/// Map a feature summary to a 0–100 semantic score.
///
/// Complexity (code files, hunks, languages), quality (tests, docs), size with
/// diminishing returns, and risk (dependencies, security paths, renames).
/// Many files touched with few hunks reads as mechanical reformatting and is
/// scaled down.
pub fn compute_raw_score(features: &DiffFeatureSummary) -> i64 {
    let complexity = CODE_FILE_WEIGHT * features.code_files.min(CODE_FILE_CAP) as f64
        + HUNK_WEIGHT * features.hunks.min(HUNK_CAP) as f64
        + LANGUAGE_WEIGHT * features.languages.min(LANGUAGE_CAP) as f64;

    let quality = TEST_FILE_WEIGHT * features.test_files.min(TEST_FILE_CAP) as f64
        + if features.doc_files > 0 { DOC_BONUS } else { 0.0 };

    let size = SIZE_WEIGHT * (1.0 - (-(features.changed_lines() as f64) / SIZE_SCALE).exp());

    let mut risk = features.renames.min(RENAME_CAP) as f64;
    if features.dependency_changes {
        risk += DEPENDENCY_RISK;
    }
    if features.security_sensitive {
        risk += SECURITY_RISK;
    }

    let mut total = complexity + quality + size + risk;
    if features.code_files > 0 && features.test_files > 0 {
        total += CODE_AND_TEST_BONUS;
    }

    if features.total_files >= COSMETIC_FILE_THRESHOLD && features.hunks <= COSMETIC_HUNK_THRESHOLD {
        total *= COSMETIC_PENALTY;
    }

    total.clamp(0.0, 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> DiffFeatureSummary {
        DiffFeatureSummary {
            total_files: 3,
            code_files: 2,
            test_files: 1,
            hunks: 4,
            languages: 1,
            additions: 120,
            deletions: 30,
            ..Default::default()
        }
    }

    #[test]
    fn empty_summary_scores_zero() {
        assert_eq!(compute_raw_score(&DiffFeatureSummary::default()), 0);
    }

    #[test]
    fn identical_input_yields_identical_output() {
        let input = features();
        assert_eq!(compute_raw_score(&input), compute_raw_score(&input.clone()));
    }

    #[test]
    fn weighted_sum_matches_components() {
        // 4 + 3.2 + 2 + 3 + 40(1 - e^-0.5) + 6 = 33.94...
        assert_eq!(compute_raw_score(&features()), 34);
    }

    #[test]
    fn cosmetic_churn_is_penalised() {
        let base = DiffFeatureSummary {
            total_files: 12,
            code_files: 12,
            hunks: 4,
            languages: 1,
            additions: 24,
            deletions: 24,
            ..Default::default()
        };
        let spread = DiffFeatureSummary { hunks: 6, ..base.clone() };

        // 6 hunks would add only 1.6 points unpenalised; the 0.85 scale removes more.
        assert!(compute_raw_score(&base) < compute_raw_score(&spread));
    }

    #[test]
    fn risk_and_renames_add_points_with_rename_cap() {
        let plain = features();
        let risky = DiffFeatureSummary {
            dependency_changes: true,
            security_sensitive: true,
            ..plain.clone()
        };
        assert_eq!(compute_raw_score(&risky) - compute_raw_score(&plain), 11);

        let five = DiffFeatureSummary { renames: 5, ..plain.clone() };
        let fifty = DiffFeatureSummary { renames: 50, ..plain };
        assert_eq!(compute_raw_score(&five), compute_raw_score(&fifty));
    }

    #[test]
    fn score_is_clamped_to_hundred() {
        let huge = DiffFeatureSummary {
            total_files: 60,
            code_files: 40,
            test_files: 20,
            doc_files: 3,
            hunks: 200,
            languages: 8,
            renames: 9,
            additions: 50_000,
            deletions: 10_000,
            dependency_changes: true,
            security_sensitive: true,
            ..Default::default()
        };
        assert_eq!(compute_raw_score(&huge), 100);
    }
}
