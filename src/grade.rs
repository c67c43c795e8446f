//! Grade normalization.
//!
//! Every provider grades on its own scale: SSL Labs hands out letters,
//! Observatory a score that can exceed 100, eco-impact tools an index.
//! The functions here project those onto a comparable 0-100 range.

/// Lowest normalized grade.
pub const MIN_GRADE: f64 = 0.0;

/// Highest normalized grade.
pub const MAX_GRADE: f64 = 100.0;

/// Projects a provider-specific raw value onto `[0, 100]`.
///
/// Implementations must be total, monotonic with the provider's own
/// quality ordering, and return values already inside the range unchanged
/// when the raw domain overlaps it.
pub trait Normalizer<R: ?Sized>: Send + Sync {
    fn normalize(&self, raw: &R) -> f64;
}

/// Clamp a score into `[0, 100]`. NaN maps to 0.
pub fn clamp(value: f64) -> f64 {
    if value.is_nan() {
        MIN_GRADE
    } else {
        value.clamp(MIN_GRADE, MAX_GRADE)
    }
}

/// Numeric reading of a display grade such as `"87"` or `"72.5"`.
pub fn parse_numeric(grade: &str) -> Option<f64> {
    let trimmed = grade.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Arithmetic mean of normalized scores; an empty set is 0.
pub fn mean<I>(scores: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = scores
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), score| (sum + score, count + 1));

    if count == 0 {
        MIN_GRADE
    } else {
        clamp(sum / count as f64)
    }
}

/// Render a normalized grade without a trailing `.0`.
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

/// Numeric scores that only need clamping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreNormalizer;

impl Normalizer<f64> for ScoreNormalizer {
    fn normalize(&self, raw: &f64) -> f64 {
        clamp(*raw)
    }
}

/// Ordered table of letter grades, best first, each mapped to the midpoint
/// of its score band.
#[derive(Debug, Clone, Copy)]
pub struct LetterGradeTable {
    entries: &'static [(&'static str, f64)],
}

/// SSL Labs letter grades.
///
/// A+, A and A- split the [80, 100) band evenly; B to F take the midpoint
/// of their own band. T (trust issues) and M (certificate name mismatch)
/// score zero.
pub const SSL_LABS_GRADES: LetterGradeTable = LetterGradeTable {
    entries: &[
        ("A+", 95.0),
        ("A", 90.0),
        ("A-", 85.0),
        ("B", 72.5),
        ("C", 57.5),
        ("D", 42.5),
        ("E", 27.5),
        ("F", 10.0),
        ("T", 0.0),
        ("M", 0.0),
    ],
};

impl LetterGradeTable {
    /// Score for a letter; letters absent from the table score 0.
    pub fn score(&self, grade: &str) -> f64 {
        let grade = grade.trim();
        self.entries
            .iter()
            .find(|(letter, _)| letter.eq_ignore_ascii_case(grade))
            .map(|(_, score)| *score)
            .unwrap_or(MIN_GRADE)
    }

    /// Normalize each sub-target independently and average them.
    pub fn mean_of<'a, I>(&self, grades: I) -> f64
    where
        I: IntoIterator<Item = &'a str>,
    {
        mean(grades.into_iter().map(|grade| self.score(grade)))
    }

}

impl Normalizer<str> for LetterGradeTable {
    fn normalize(&self, raw: &str) -> f64 {
        match parse_numeric(raw) {
            // already on the 0-100 scale
            Some(value) => clamp(value),
            None => self.score(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_grades_are_in_range_and_ordered() {
        let scores: Vec<f64> = SSL_LABS_GRADES
            .entries
            .iter()
            .map(|(letter, _)| SSL_LABS_GRADES.score(letter))
            .collect();

        for score in &scores {
            assert!((MIN_GRADE..=MAX_GRADE).contains(score));
        }
        // best first, so scores never increase along the table
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1], "{:?} is not ordered", pair);
        }
    }

    #[test]
    fn test_letter_grade_monotonic_examples() {
        let f = SSL_LABS_GRADES.normalize("F");
        let c = SSL_LABS_GRADES.normalize("C");
        let a = SSL_LABS_GRADES.normalize("A");
        assert!(f <= c && c <= a);
        assert_eq!(SSL_LABS_GRADES.normalize("A+"), 95.0);
        assert_eq!(SSL_LABS_GRADES.normalize("B"), 72.5);
    }

    #[test]
    fn test_unknown_letter_is_zero() {
        assert_eq!(SSL_LABS_GRADES.normalize("Z"), 0.0);
        assert_eq!(SSL_LABS_GRADES.normalize(""), 0.0);
    }

    #[test]
    fn test_letter_table_is_idempotent_on_scores() {
        let once = SSL_LABS_GRADES.normalize("A-");
        let twice = SSL_LABS_GRADES.normalize(format_score(once).as_str());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_mean_of_endpoints() {
        assert_eq!(SSL_LABS_GRADES.mean_of(["A+", "A-"]), 90.0);
        assert_eq!(SSL_LABS_GRADES.mean_of(Vec::<&str>::new()), 0.0);
    }

    #[test]
    fn test_clamp_and_score_normalizer() {
        assert_eq!(clamp(120.0), 100.0);
        assert_eq!(clamp(-5.0), 0.0);
        assert_eq!(clamp(f64::NAN), 0.0);
        assert_eq!(clamp(f64::INFINITY), 100.0);

        let once = ScoreNormalizer.normalize(&135.0);
        assert_eq!(ScoreNormalizer.normalize(&once), once);
        assert_eq!(ScoreNormalizer.normalize(&42.0), 42.0);
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("87"), Some(87.0));
        assert_eq!(parse_numeric(" 72.5 "), Some(72.5));
        assert_eq!(parse_numeric("A+"), None);
        assert_eq!(parse_numeric(""), None);
        assert_eq!(parse_numeric("NaN"), None);
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(90.0), "90");
        assert_eq!(format_score(72.5), "72.5");
    }
}
