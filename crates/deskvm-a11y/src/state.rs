//! Semantic state flags decoded from `GetState` bitmasks.

use std::fmt;

/// AT-SPI state flags, in `AtspiStateType` order (the discriminant is the
/// bit position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum State {
    Invalid = 0,
    Active,
    Armed,
    Busy,
    Checked,
    Collapsed,
    Defunct,
    Editable,
    Enabled,
    Expandable,
    Expanded,
    Focusable,
    Focused,
    HasTooltip,
    Horizontal,
    Iconified,
    Modal,
    MultiLine,
    Multiselectable,
    Opaque,
    Pressed,
    Resizable,
    Selectable,
    Selected,
    Sensitive,
    Showing,
    SingleLine,
    Stale,
    Transient,
    Vertical,
    Visible,
    ManagesDescendants,
    Indeterminate,
    Required,
    Truncated,
    Animated,
    InvalidEntry,
    SupportsAutocompletion,
    SelectableText,
    IsDefault,
    Visited,
    Checkable,
    HasPopup,
    ReadOnly,
}

impl State {
    /// Every known flag, in bit order.
    pub const ALL: [Self; 44] = [
        Self::Invalid,
        Self::Active,
        Self::Armed,
        Self::Busy,
        Self::Checked,
        Self::Collapsed,
        Self::Defunct,
        Self::Editable,
        Self::Enabled,
        Self::Expandable,
        Self::Expanded,
        Self::Focusable,
        Self::Focused,
        Self::HasTooltip,
        Self::Horizontal,
        Self::Iconified,
        Self::Modal,
        Self::MultiLine,
        Self::Multiselectable,
        Self::Opaque,
        Self::Pressed,
        Self::Resizable,
        Self::Selectable,
        Self::Selected,
        Self::Sensitive,
        Self::Showing,
        Self::SingleLine,
        Self::Stale,
        Self::Transient,
        Self::Vertical,
        Self::Visible,
        Self::ManagesDescendants,
        Self::Indeterminate,
        Self::Required,
        Self::Truncated,
        Self::Animated,
        Self::InvalidEntry,
        Self::SupportsAutocompletion,
        Self::SelectableText,
        Self::IsDefault,
        Self::Visited,
        Self::Checkable,
        Self::HasPopup,
        Self::ReadOnly,
    ];

    /// Bit position of this flag.
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Lowercase name, as AT-SPI tools print it.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Active => "active",
            Self::Armed => "armed",
            Self::Busy => "busy",
            Self::Checked => "checked",
            Self::Collapsed => "collapsed",
            Self::Defunct => "defunct",
            Self::Editable => "editable",
            Self::Enabled => "enabled",
            Self::Expandable => "expandable",
            Self::Expanded => "expanded",
            Self::Focusable => "focusable",
            Self::Focused => "focused",
            Self::HasTooltip => "has_tooltip",
            Self::Horizontal => "horizontal",
            Self::Iconified => "iconified",
            Self::Modal => "modal",
            Self::MultiLine => "multi_line",
            Self::Multiselectable => "multiselectable",
            Self::Opaque => "opaque",
            Self::Pressed => "pressed",
            Self::Resizable => "resizable",
            Self::Selectable => "selectable",
            Self::Selected => "selected",
            Self::Sensitive => "sensitive",
            Self::Showing => "showing",
            Self::SingleLine => "single_line",
            Self::Stale => "stale",
            Self::Transient => "transient",
            Self::Vertical => "vertical",
            Self::Visible => "visible",
            Self::ManagesDescendants => "manages_descendants",
            Self::Indeterminate => "indeterminate",
            Self::Required => "required",
            Self::Truncated => "truncated",
            Self::Animated => "animated",
            Self::InvalidEntry => "invalid_entry",
            Self::SupportsAutocompletion => "supports_autocompletion",
            Self::SelectableText => "selectable_text",
            Self::IsDefault => "is_default",
            Self::Visited => "visited",
            Self::Checkable => "checkable",
            Self::HasPopup => "has_popup",
            Self::ReadOnly => "read_only",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of states held by a node at the time it was queried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSet {
    states: Vec<State>,
}

impl StateSet {
    /// Decodes the words returned by `GetState`.
    ///
    /// Only the first word is read. Every known flag position is tested
    /// against it; bits without a known flag are ignored so that newer
    /// toolkits don't break decoding.
    #[must_use]
    pub fn from_words(words: &[u32]) -> Self {
        let word = u64::from(words.first().copied().unwrap_or(0));
        let states = State::ALL
            .iter()
            .copied()
            .filter(|state| word & (1u64 << state.bit()) != 0)
            .collect();
        Self { states }
    }

    /// Returns true if `state` is set.
    #[must_use]
    pub fn contains(&self, state: State) -> bool {
        self.states.contains(&state)
    }

    /// Iterates over the set states in bit order.
    pub fn iter(&self) -> impl Iterator<Item = State> + '_ {
        self.states.iter().copied()
    }

    /// Number of set states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no state is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl fmt::Display for StateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.states.iter().map(|s| s.name()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_first_word() {
        let word = (1 << State::Editable.bit()) | (1 << State::Focused.bit());
        let set = StateSet::from_words(&[word, 0]);
        assert!(set.contains(State::Editable));
        assert!(set.contains(State::Focused));
        assert!(!set.contains(State::Showing));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_second_word_ignored() {
        let set = StateSet::from_words(&[0, u32::MAX]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_empty_reply() {
        assert!(StateSet::from_words(&[]).is_empty());
    }

    #[test]
    fn test_all_bits_only_known_low_flags() {
        let set = StateSet::from_words(&[u32::MAX]);
        // Flags above bit 31 live in the second word, which is not decoded.
        assert_eq!(set.len(), 32);
        assert!(set.contains(State::Visible));
        assert!(!set.contains(State::ReadOnly));
    }

    #[test]
    fn test_display() {
        let set = StateSet::from_words(&[(1 << State::Enabled.bit()) | (1 << State::Sensitive.bit())]);
        assert_eq!(set.to_string(), "[enabled, sensitive]");
    }

    #[test]
    fn test_bit_positions_match_table() {
        for (i, state) in State::ALL.iter().enumerate() {
            assert_eq!(state.bit() as usize, i);
        }
    }
}
