//! Selection of stored files for download and delete runs.

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metadata::FileMetadata;

/// Which of an owner's files a run works on.
///
/// A file matches when its name matches `pattern` and its upload time lies
/// in `from..=to`. Missing bounds default to the Unix epoch and to the
/// moment the filter is compiled.
///
/// # Examples
///
/// ```
/// use xfer::FileFilter;
///
/// let filter = FileFilter::new("*.csv");
/// let compiled = filter.compile().unwrap();
/// assert!(compiled.matches_name("report.csv"));
/// assert!(!compiled.matches_name("report.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    /// Glob over file names.
    pub pattern: String,
    /// Earliest upload time, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    /// Latest upload time, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::new("*")
    }
}

impl FileFilter {
    /// A filter on names only.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            from: None,
            to: None,
        }
    }

    /// Sets the earliest upload time.
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Sets the latest upload time.
    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    /// Validates the filter and pins its bounds.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidFilter`] for a malformed glob or a range whose start
    /// is after its end.
    pub fn compile(&self) -> Result<CompiledFilter> {
        let pattern =
            Pattern::new(&self.pattern).map_err(|e| Error::InvalidFilter(e.to_string()))?;
        let from = self.from.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let to = self.to.unwrap_or_else(Utc::now);
        if from > to {
            return Err(Error::InvalidFilter(format!(
                "range starts at {from} after it ends at {to}"
            )));
        }
        Ok(CompiledFilter { pattern, from, to })
    }
}

/// A validated [`FileFilter`] with concrete bounds.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pattern: Pattern,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl CompiledFilter {
    /// Returns `true` if the name matches the glob.
    pub fn matches_name(&self, filename: &str) -> bool {
        self.pattern.matches(filename)
    }

    /// Returns `true` if the file is selected.
    pub fn matches(&self, file: &FileMetadata) -> bool {
        self.matches_name(&file.filename) && self.from <= file.uploaded_at && file.uploaded_at <= self.to
    }

    /// The selected files, in input order.
    pub fn select(&self, files: Vec<FileMetadata>) -> Vec<FileMetadata> {
        files.into_iter().filter(|f| self.matches(f)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    fn file(name: &str, day: u32) -> FileMetadata {
        FileMetadata {
            owner_id: "u1".to_string(),
            filename: name.to_string(),
            uploaded_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            size: 1,
        }
    }

    #[test]
    fn default_matches_everything_up_to_now() {
        let compiled = FileFilter::default().compile().unwrap();
        assert!(compiled.matches(&file("anything.bin", 1)));
    }

    #[test]
    fn date_bounds_are_inclusive() {
        let compiled = FileFilter::new("*")
            .from(Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap())
            .to(Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap())
            .compile()
            .unwrap();

        let names: Vec<String> = compiled
            .select((1..=5).map(|d| file(&format!("f{d}"), d)).collect())
            .into_iter()
            .map(|f| f.filename)
            .collect();
        assert_eq!(names, vec!["f2", "f3", "f4"]);
    }

    #[test]
    fn glob_and_dates_combine() {
        let compiled = FileFilter::new("*.csv")
            .from(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap())
            .compile()
            .unwrap();
        assert!(compiled.matches(&file("b.csv", 3)));
        assert!(!compiled.matches(&file("a.csv", 1)));
        assert!(!compiled.matches(&file("b.txt", 3)));
    }

    #[test]
    fn malformed_glob_is_rejected() {
        assert!(matches!(
            FileFilter::new("[unclosed").compile(),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = FileFilter::new("*")
            .from(Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap())
            .to(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
            .compile()
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    proptest::proptest! {
        #[test]
        fn selection_is_an_order_preserving_subset(
            days in proptest::collection::vec(1u32..=28, 0..20),
            from in 1u32..=28,
            span in 0u32..=10,
        ) {
            let to = (from + span).min(28);
            let compiled = FileFilter::new("*.csv")
                .from(Utc.with_ymd_and_hms(2024, 3, from, 0, 0, 0).unwrap())
                .to(Utc.with_ymd_and_hms(2024, 3, to, 23, 59, 59).unwrap())
                .compile()
                .unwrap();

            let files: Vec<FileMetadata> = days
                .iter()
                .enumerate()
                .map(|(i, &d)| file(&format!("{i:02}.{}", if d % 2 == 0 { "csv" } else { "txt" }), d))
                .collect();
            let expected: Vec<String> = files
                .iter()
                .filter(|f| f.filename.ends_with(".csv"))
                .filter(|f| (from..=to).contains(&f.uploaded_at.day()))
                .map(|f| f.filename.clone())
                .collect();

            let selected: Vec<String> =
                compiled.select(files).into_iter().map(|f| f.filename).collect();
            proptest::prop_assert_eq!(selected, expected);
        }
    }
}
