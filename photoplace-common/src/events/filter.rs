//! Event filters and the per-observer binding merge rules
//!
//! An observer may hold several bindings, each a filter plus bound
//! arguments. New subscriptions are merged into the existing bindings by a
//! small state machine so a catch-all observer never fans out twice.

use super::args::CallArgs;

/// Which events a binding reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Unset filter: matches every event
    Any,
    /// Matches exactly one event name
    Exact(String),
    /// Matches any member of the set
    OneOf(Vec<String>),
}

impl EventFilter {
    /// Match `event` against this filter
    ///
    /// ORed cascade, first true wins: set membership, equality, unset.
    pub fn matches(&self, event: &str) -> bool {
        let checks: [fn(&EventFilter, &str) -> bool; 3] = [in_set, equals, unset];
        checks.iter().any(|check| check(self, event))
    }

    /// True for the catch-all filter
    pub fn is_any(&self) -> bool {
        matches!(self, EventFilter::Any)
    }

    /// Event names named by this filter (empty for the catch-all)
    pub fn names(&self) -> Vec<&str> {
        match self {
            EventFilter::Any => Vec::new(),
            EventFilter::Exact(name) => vec![name.as_str()],
            EventFilter::OneOf(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Add the names of `other` to this set filter, skipping members
    ///
    /// Returns how many names were added. Only set filters grow.
    fn absorb(&mut self, other: &EventFilter) -> usize {
        let EventFilter::OneOf(set) = self else {
            return 0;
        };
        let mut added = 0;
        for name in other.names() {
            if !set.iter().any(|member| member == name) {
                set.push(name.to_string());
                added += 1;
            }
        }
        added
    }
}

fn in_set(filter: &EventFilter, event: &str) -> bool {
    matches!(filter, EventFilter::OneOf(set) if set.iter().any(|name| name == event))
}

fn equals(filter: &EventFilter, event: &str) -> bool {
    matches!(filter, EventFilter::Exact(name) if name == event)
}

fn unset(filter: &EventFilter, _event: &str) -> bool {
    filter.is_any()
}

impl From<&str> for EventFilter {
    fn from(name: &str) -> Self {
        EventFilter::Exact(name.to_string())
    }
}

impl From<String> for EventFilter {
    fn from(name: String) -> Self {
        EventFilter::Exact(name)
    }
}

impl From<Vec<String>> for EventFilter {
    fn from(names: Vec<String>) -> Self {
        EventFilter::OneOf(names)
    }
}

impl From<&[&str]> for EventFilter {
    fn from(names: &[&str]) -> Self {
        EventFilter::OneOf(names.iter().map(|name| name.to_string()).collect())
    }
}

impl From<Option<&str>> for EventFilter {
    fn from(name: Option<&str>) -> Self {
        name.map_or(EventFilter::Any, EventFilter::from)
    }
}

/// One registered (filter, bound arguments) pair of an observer
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Events this binding reacts to
    pub filter: EventFilter,
    /// Arguments replayed in front of the call-time arguments
    pub args: CallArgs,
}

impl Binding {
    /// New binding
    pub fn new(filter: EventFilter, args: CallArgs) -> Self {
        Self { filter, args }
    }
}

/// What `subscribe` did with a new binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Appended as a new binding
    Added,
    /// Observer already has a catch-all binding; nothing added
    Absorbed,
    /// Names merged into an existing set binding
    Merged,
    /// Catch-all replaced the specific bindings carrying the same arguments
    Promoted,
    /// Identical binding already present
    Unchanged,
}

/// Binding shape of one observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingState {
    /// Not subscribed at all
    Unbound,
    /// Holds a catch-all binding (possibly among others)
    CatchAll,
    /// Holds only specific (exact or set) bindings
    Specific,
}

impl BindingState {
    pub(crate) fn of(bindings: &[Binding]) -> Self {
        if bindings.is_empty() {
            BindingState::Unbound
        } else if bindings.iter().any(|b| b.filter.is_any()) {
            BindingState::CatchAll
        } else {
            BindingState::Specific
        }
    }
}

/// Merge `new` into an observer's bindings
///
/// Transitions:
/// - `Unbound` → `Added`
/// - `CatchAll` + anything → `Absorbed` (the new arguments are dropped)
/// - `Specific` + identical binding → `Unchanged`
/// - `Specific` + catch-all → `Promoted` when bindings with the same
///   arguments existed (they are replaced), else `Added`
/// - `Specific` + exact/set with the same arguments as a set binding →
///   `Merged` (or `Unchanged` when every name was already a member)
/// - otherwise → `Added`
pub(crate) fn merge_binding(bindings: &mut Vec<Binding>, new: Binding) -> SubscribeOutcome {
    match BindingState::of(bindings) {
        BindingState::Unbound => {
            bindings.push(new);
            SubscribeOutcome::Added
        }
        BindingState::CatchAll => SubscribeOutcome::Absorbed,
        BindingState::Specific => {
            if bindings.contains(&new) {
                return SubscribeOutcome::Unchanged;
            }

            if new.filter.is_any() {
                let before = bindings.len();
                bindings.retain(|b| b.args != new.args);
                let replaced = before - bindings.len();
                bindings.push(new);
                return if replaced > 0 {
                    SubscribeOutcome::Promoted
                } else {
                    SubscribeOutcome::Added
                };
            }

            let set = bindings
                .iter_mut()
                .find(|b| matches!(b.filter, EventFilter::OneOf(_)) && b.args == new.args);
            match set {
                Some(existing) => {
                    if existing.filter.absorb(&new.filter) > 0 {
                        SubscribeOutcome::Merged
                    } else {
                        SubscribeOutcome::Unchanged
                    }
                }
                None => {
                    bindings.push(new);
                    SubscribeOutcome::Added
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> EventFilter {
        EventFilter::from(names)
    }

    #[test]
    fn test_filter_cascade() {
        assert!(EventFilter::Any.matches("Load:start"));
        assert!(EventFilter::from("Load:start").matches("Load:start"));
        assert!(!EventFilter::from("Load:start").matches("Load:finish"));
        assert!(set(&["a", "b"]).matches("b"));
        assert!(!set(&["a", "b"]).matches("c"));
        assert!(!set(&[]).matches("a"));
        assert_eq!(EventFilter::from(None::<&str>), EventFilter::Any);
    }

    #[test]
    fn test_unbound_adds() {
        let mut bindings = Vec::new();
        let outcome = merge_binding(&mut bindings, Binding::new("a".into(), CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Added);
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_catch_all_absorbs() {
        let mut bindings = vec![Binding::new(EventFilter::Any, CallArgs::new())];
        let outcome = merge_binding(&mut bindings, Binding::new("a".into(), CallArgs::new().arg(1)));
        assert_eq!(outcome, SubscribeOutcome::Absorbed);
        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].filter.is_any());

        let again = merge_binding(&mut bindings, Binding::new(EventFilter::Any, CallArgs::new()));
        assert_eq!(again, SubscribeOutcome::Absorbed);
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_set_merge_deduplicates() {
        let mut bindings = vec![Binding::new(set(&["a"]), CallArgs::new())];

        let outcome = merge_binding(&mut bindings, Binding::new("b".into(), CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Merged);

        let outcome = merge_binding(&mut bindings, Binding::new(set(&["a", "b"]), CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Unchanged);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].filter, set(&["a", "b"]));
    }

    #[test]
    fn test_set_with_other_args_adds_binding() {
        let mut bindings = vec![Binding::new(set(&["a"]), CallArgs::new().arg("x"))];
        let outcome = merge_binding(&mut bindings, Binding::new("b".into(), CallArgs::new().arg("y")));
        assert_eq!(outcome, SubscribeOutcome::Added);
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn test_exact_is_idempotent() {
        let mut bindings = vec![Binding::new("a".into(), CallArgs::new())];
        let outcome = merge_binding(&mut bindings, Binding::new("a".into(), CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Unchanged);

        let outcome = merge_binding(&mut bindings, Binding::new("b".into(), CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Added);
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn test_catch_all_promotes_same_args() {
        let mut bindings = vec![
            Binding::new("a".into(), CallArgs::new()),
            Binding::new("b".into(), CallArgs::new().arg("keep")),
        ];
        let outcome = merge_binding(&mut bindings, Binding::new(EventFilter::Any, CallArgs::new()));
        assert_eq!(outcome, SubscribeOutcome::Promoted);
        assert_eq!(bindings.len(), 2);
        assert_eq!(BindingState::of(&bindings), BindingState::CatchAll);
        assert_eq!(bindings[0].filter, EventFilter::from("b"));
    }
}
