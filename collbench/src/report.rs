//! Console report: table header and one row per swept size.

use std::io::Write;

/// Width of the in-place column group; out-of-place rows are shifted by it.
const IN_PLACE_COLUMNS: usize = 33;

pub const HEADER: &str = "#\n\
#                                        in-place                       out-of-place\n\
#       size         count     time   algbw   busbw  #wrong     time   algbw   busbw  #wrong\n\
#        (B)    (elements)     (us)  (GB/s)  (GB/s)             (us)  (GB/s)  (GB/s)\n";

/// One measured size, as seen by the reporting rank.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Larger of the send and expected byte counts.
    pub size: usize,
    /// Parameter bytes in 4-byte elements.
    pub count: usize,
    pub in_place: bool,
    /// Reduced per-op time in seconds.
    pub time_sec: f64,
    pub algbw: f64,
    pub busbw: f64,
    /// Global mismatch count; `None` when validation is off.
    pub wrong: Option<u64>,
}

/// Microseconds with precision that shrinks as the value grows.
pub fn format_time(usec: f64) -> String {
    if usec >= 10000.0 {
        format!("{usec:7.0}")
    } else if usec >= 100.0 {
        format!("{usec:7.1}")
    } else {
        format!("{usec:7.2}")
    }
}

impl ResultRow {
    pub fn format(&self) -> String {
        let mut line = format!("{:>12}  {:>12}", self.size, self.count);
        if !self.in_place {
            line.push_str(&" ".repeat(IN_PLACE_COLUMNS));
        }
        line.push_str(&format!(
            "  {:>7}  {:>6.2}  {:>6.2}",
            format_time(self.time_sec * 1e6),
            self.algbw,
            self.busbw
        ));
        if let Some(wrong) = self.wrong {
            line.push_str(&format!("  {wrong:>5}"));
        }
        line
    }
}

/// Output sink for the rank that reports.
///
/// Non-reporting ranks build one with `enabled == false` and every call is
/// a no-op. Lines are kept so callers and tests can inspect the report.
#[derive(Debug, Default)]
pub struct Reporter {
    enabled: bool,
    echo: bool,
    text: String,
}

impl Reporter {
    /// Reporter that also writes to stdout.
    pub fn stdout(enabled: bool) -> Self {
        Self {
            enabled,
            echo: true,
            text: String::new(),
        }
    }

    /// Reporter that only records.
    pub fn captured(enabled: bool) -> Self {
        Self {
            enabled,
            echo: false,
            text: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Emit `text` verbatim.
    pub fn print(&mut self, text: &str) {
        if !self.enabled {
            return;
        }
        self.text.push_str(text);
        if self.echo {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }

    pub fn header(&mut self) {
        self.print(HEADER);
    }

    pub fn row(&mut self, row: &ResultRow) {
        let line = row.format() + "\n";
        self.print(&line);
    }

    /// Everything printed so far.
    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(in_place: bool, wrong: Option<u64>) -> ResultRow {
        ResultRow {
            size: 1 << 20,
            count: 1 << 18,
            in_place,
            time_sec: 123.456e-6,
            algbw: 8.4932,
            busbw: 4.2466,
            wrong,
        }
    }

    #[test]
    fn test_time_precision() {
        assert_eq!(format_time(12345.6), "  12346");
        assert_eq!(format_time(123.45), "  123.5");
        assert_eq!(format_time(1.234), "   1.23");
    }

    #[test]
    fn test_in_place_row() {
        assert_eq!(
            row(true, Some(0)).format(),
            "     1048576        262144    123.5    8.49    4.25      0"
        );
    }

    #[test]
    fn test_out_of_place_row_is_shifted() {
        let line = row(false, Some(3)).format();
        assert!(line.starts_with("     1048576        262144"));
        assert_eq!(line.len(), row(true, Some(3)).format().len() + IN_PLACE_COLUMNS);
        assert!(line.ends_with("      3"));
    }

    #[test]
    fn test_row_without_validation() {
        let line = row(true, None).format();
        assert!(line.ends_with("    8.49    4.25"));
    }

    #[test]
    fn test_disabled_reporter_is_silent() {
        let mut r = Reporter::captured(false);
        r.header();
        r.row(&row(true, None));
        assert!(r.text().is_empty());

        let mut r = Reporter::captured(true);
        r.header();
        assert!(r.text().starts_with("#\n#  "));
    }
}
