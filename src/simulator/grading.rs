//! Reading `lab grade` output.
//!
//! Grading scripts print one line per check ending in PASS or FAIL (or a
//! check mark), sometimes an explicit `Score: N/M` line, and usually an
//! overall verdict. An explicit score wins; otherwise per-check lines are
//! counted and the overall line is only used when no check line exists.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::remote::CommandOutcome;

static SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\W*(?:overall\s+)?score\s*:?\s*(\d+)\s*/\s*(\d+)").expect("score regex is valid")
});
static PASS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bPASS(ED)?\b|✓").expect("pass regex is valid"));
static FAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bFAIL(ED)?\b|✗").expect("fail regex is valid"));
static OVERALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\boverall\b").expect("overall regex is valid"));

/// Counts read from one grading run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GradeReport {
    pub passed: usize,
    pub failed: usize,
    /// Explicit `N/M` score, when printed
    pub score: Option<(usize, usize)>,
    /// Overall verdict line, when printed
    pub overall: Option<bool>,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl GradeReport {
    /// True when the output said anything about passing or failing.
    pub fn has_verdict(&self) -> bool {
        self.score.is_some() || self.passed + self.failed > 0 || self.overall.is_some()
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && (self.passed > 0 || self.overall == Some(true))
    }

    pub fn describe(&self) -> String {
        match self.score {
            Some((got, of)) => format!("score {}/{}", got, of),
            None => format!("{} PASS, {} FAIL", self.passed, self.failed),
        }
    }
}

pub fn parse(outcome: &CommandOutcome) -> GradeReport {
    let text = outcome.combined_output();
    let mut report = GradeReport {
        exit_code: outcome.exit_code,
        timed_out: outcome.timed_out,
        ..GradeReport::default()
    };

    if let Some(caps) = SCORE.captures(&text) {
        let got: usize = caps[1].parse().unwrap_or(0);
        let of: usize = caps[2].parse().unwrap_or(0);
        report.score = Some((got, of));
        report.passed = got.min(of);
        report.failed = of.saturating_sub(got);
        return report;
    }

    for line in text.lines() {
        let pass = PASS.find_iter(line).count();
        let fail = FAIL.find_iter(line).count();
        if OVERALL.is_match(line) {
            if fail > 0 {
                report.overall = Some(false);
            } else if pass > 0 {
                report.overall = Some(true);
            }
            continue;
        }
        report.passed += pass;
        report.failed += fail;
    }

    if report.passed + report.failed == 0 {
        match report.overall {
            Some(true) => report.passed = 1,
            Some(false) => report.failed = 1,
            None => {}
        }
    }
    report
}

/// How a grading run compares with what the exercise state should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GradeVerdict {
    Expected,
    FalsePositive { detail: String },
    FalseNegative { detail: String },
    Crashed { detail: String },
}

impl GradeVerdict {
    pub fn is_expected(&self) -> bool {
        matches!(self, GradeVerdict::Expected)
    }
}

fn crashed(report: &GradeReport, outcome: &CommandOutcome) -> Option<GradeVerdict> {
    if report.timed_out {
        return Some(GradeVerdict::Crashed {
            detail: outcome.summary(),
        });
    }
    if report.exit_code != 0 {
        let detail = if report.has_verdict() {
            format!("exit code {} with {}", report.exit_code, report.describe())
        } else {
            outcome.summary()
        };
        return Some(GradeVerdict::Crashed { detail });
    }
    if !report.has_verdict() {
        return Some(GradeVerdict::Crashed {
            detail: "no PASS or FAIL lines in grading output".to_string(),
        });
    }
    None
}

/// Before any work, grading must report at least one FAIL.
pub fn judge_unsolved(outcome: &CommandOutcome) -> (GradeReport, GradeVerdict) {
    let report = parse(outcome);
    let verdict = crashed(&report, outcome).unwrap_or_else(|| {
        if report.failed > 0 {
            GradeVerdict::Expected
        } else {
            GradeVerdict::FalsePositive {
                detail: report.describe(),
            }
        }
    });
    (report, verdict)
}

/// After the steps, grading must report no FAIL.
pub fn judge_solved(outcome: &CommandOutcome) -> (GradeReport, GradeVerdict) {
    let report = parse(outcome);
    let verdict = crashed(&report, outcome).unwrap_or_else(|| {
        if report.all_passed() {
            GradeVerdict::Expected
        } else {
            GradeVerdict::FalseNegative {
                detail: report.describe(),
            }
        }
    });
    (report, verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn graded(stdout: &str, exit_code: i32) -> CommandOutcome {
        CommandOutcome::completed("lab grade x", stdout.to_string(), String::new(), exit_code, Duration::ZERO)
    }

    const UNSOLVED: &str = "\
Grading lab.

 · Checking the web server ......... FAIL
 · Checking the firewall ........... PASS

Overall lab grade ................. FAIL
";

    const SOLVED: &str = "\
 · Checking the web server ......... PASS
 · Checking the firewall ........... PASS

Overall lab grade ................. PASS
";

    #[test]
    fn test_counts_exclude_overall_line() {
        let report = parse(&graded(UNSOLVED, 1));
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.overall, Some(false));
    }

    #[test]
    fn test_explicit_score_wins() {
        let report = parse(&graded("Check a PASS\nScore: 3/5\n", 1));
        assert_eq!(report.score, Some((3, 5)));
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn test_check_marks_are_counted() {
        let report = parse(&graded("✓ service running\n✗ port open\n✗ file present\n", 1));
        assert_eq!((report.passed, report.failed), (1, 2));
    }

    #[test]
    fn test_unsolved_grade_must_fail() {
        let (_, verdict) = judge_unsolved(&graded(UNSOLVED, 0));
        assert!(verdict.is_expected());

        let (_, verdict) = judge_unsolved(&graded(SOLVED, 0));
        assert_eq!(
            verdict,
            GradeVerdict::FalsePositive {
                detail: "2 PASS, 0 FAIL".to_string()
            }
        );
    }

    #[test]
    fn test_solved_grade_must_pass() {
        let (_, verdict) = judge_solved(&graded(SOLVED, 0));
        assert!(verdict.is_expected());

        let (_, verdict) = judge_solved(&graded(UNSOLVED, 0));
        assert!(matches!(verdict, GradeVerdict::FalseNegative { .. }));
    }

    #[test]
    fn test_non_zero_exit_is_crash_even_with_verdict() {
        let (report, verdict) = judge_unsolved(&graded(UNSOLVED, 1));
        assert_eq!(report.failed, 1);
        assert_eq!(
            verdict,
            GradeVerdict::Crashed {
                detail: "exit code 1 with 1 PASS, 1 FAIL".to_string()
            }
        );

        let (_, verdict) = judge_solved(&graded(SOLVED, 2));
        assert!(matches!(verdict, GradeVerdict::Crashed { .. }));
    }

    #[test]
    fn test_silent_or_timed_out_grade_crashed() {
        let (_, verdict) = judge_unsolved(&graded("Traceback (most recent call last):\n", 1));
        assert!(matches!(verdict, GradeVerdict::Crashed { .. }));

        let (_, verdict) = judge_solved(&graded("", 0));
        assert!(matches!(verdict, GradeVerdict::Crashed { .. }));

        let timeout = CommandOutcome::timed_out("lab grade x", String::new(), Duration::from_secs(1), Duration::from_secs(1));
        let (_, verdict) = judge_solved(&timeout);
        assert!(matches!(verdict, GradeVerdict::Crashed { .. }));
    }

    #[test]
    fn test_overall_line_alone_is_used() {
        let (report, verdict) = judge_solved(&graded("Overall lab grade: PASS\n", 0));
        assert_eq!(report.passed, 1);
        assert!(verdict.is_expected());
    }
}
