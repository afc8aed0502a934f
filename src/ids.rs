//! Human-readable sequential identifiers (`F-001`, `W-014`).
//!
//! Ids are derived from the current maximum plus one, which races under
//! concurrent creates. Collisions surface from the store's primary key as
//! [`KbError::DuplicateKey`](crate::KbError::DuplicateKey) and the coordinator
//! retries with a freshly read maximum, up to a configured attempt budget.

/// Sequences backed by a `PREFIX-NNN` text primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdSequence {
    /// `funds.fund_id`.
    Fund,
    /// `term.word_id`.
    Term,
}

impl IdSequence {
    /// Letter preceding the dash.
    pub fn prefix(self) -> &'static str {
        match self {
            IdSequence::Fund => "F",
            IdSequence::Term => "W",
        }
    }

    /// Table holding the sequence.
    pub fn table(self) -> &'static str {
        match self {
            IdSequence::Fund => "funds",
            IdSequence::Term => "term",
        }
    }

    /// Primary key column.
    pub fn column(self) -> &'static str {
        match self {
            IdSequence::Fund => "fund_id",
            IdSequence::Term => "word_id",
        }
    }

    /// Renders `n` zero-padded to three digits; larger numbers keep all digits.
    pub fn format(self, n: u32) -> String {
        format!("{}-{:03}", self.prefix(), n)
    }

    /// Numeric part of an id in this sequence.
    pub fn parse(self, id: &str) -> Option<u32> {
        let digits = id.strip_prefix(self.prefix())?.strip_prefix('-')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Id following `current_max` (`None` when the table holds no ids yet).
    pub fn next_after(self, current_max: Option<u32>) -> String {
        self.format(current_max.unwrap_or(0).saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_padded() {
        assert_eq!(IdSequence::Fund.format(7), "F-007");
        assert_eq!(IdSequence::Term.format(42), "W-042");
        assert_eq!(IdSequence::Fund.format(1234), "F-1234");
    }

    #[test]
    fn parses_only_own_prefix() {
        assert_eq!(IdSequence::Fund.parse("F-012"), Some(12));
        assert_eq!(IdSequence::Fund.parse("W-012"), None);
        assert_eq!(IdSequence::Term.parse("W-"), None);
        assert_eq!(IdSequence::Term.parse("W-1a"), None);
    }

    #[test]
    fn next_starts_at_one() {
        assert_eq!(IdSequence::Fund.next_after(None), "F-001");
        assert_eq!(IdSequence::Term.next_after(Some(9)), "W-010");
    }
}
