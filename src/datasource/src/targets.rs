//! Target expression resolution.
//!
//! Every target of a panel gets a series letter by position (`A` for the
//! first, `B` for the second, ...). Expressions may embed another target's
//! expression with a `#<LETTER>` back-reference, e.g. `asPercent(#A, #B)`.
//!
//! Resolution happens in two passes separated by a barrier:
//!
//! 1. substitution: template variables and interval literals are expanded for
//!    every non-empty target, hidden or not;
//! 2. cross-referencing: back-references of every visible target are replaced
//!    with the pass 1 result of the referenced target.
//!
//! Pass 2 only ever reads the immutable pass 1 snapshot, so declaration order
//! does not matter and forward references work.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{DatasourceError, Result};
use crate::template::{ScopedVars, VariableLookup};

static INTERVAL_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)'(\d+)(m)'").expect("interval pattern is valid"));

static BACK_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([A-Z])").expect("back-reference pattern is valid"));

/// One series expression of a dashboard panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTarget {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub hide: bool,
    /// Editor-side identifier; not used for resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

impl QueryTarget {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Default::default()
        }
    }

    pub fn hidden(target: &str) -> Self {
        Self {
            target: target.to_string(),
            hide: true,
            ..Default::default()
        }
    }
}

/// Positional series reference letter, `A` through `Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesLetter(u8);

impl SeriesLetter {
    /// Number of available letters, and therefore the target ceiling.
    pub const COUNT: usize = 26;

    pub fn from_index(index: usize) -> Option<Self> {
        u8::try_from(index)
            .ok()
            .filter(|i| usize::from(*i) < Self::COUNT)
            .map(|i| Self(b'A' + i))
    }

    pub fn from_char(c: char) -> Option<Self> {
        c.is_ascii_uppercase().then(|| Self(c as u8))
    }

    pub fn as_char(self) -> char {
        char::from(self.0)
    }
}

impl fmt::Display for SeriesLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Letter for each target position, fixed before resolution starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LetterAssignment {
    letters: Vec<SeriesLetter>,
}

impl LetterAssignment {
    /// Assign letters by position. More than 26 targets is an error; letters
    /// never wrap around.
    pub fn assign(targets: &[QueryTarget]) -> Result<Self> {
        let letters = (0..targets.len())
            .map(SeriesLetter::from_index)
            .collect::<Option<Vec<_>>>()
            .ok_or(DatasourceError::TooManyTargets {
                count: targets.len(),
                max: SeriesLetter::COUNT,
            })?;
        Ok(Self { letters })
    }

    pub fn letter(&self, index: usize) -> Option<SeriesLetter> {
        self.letters.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }
}

/// Pass 1 output: letter -> substituted expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutedTargets(BTreeMap<SeriesLetter, String>);

impl SubstitutedTargets {
    pub fn get(&self, letter: SeriesLetter) -> Option<&str> {
        self.0.get(&letter).map(String::as_str)
    }

    pub fn contains(&self, letter: SeriesLetter) -> bool {
        self.0.contains_key(&letter)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A target ready to be emitted as a `target=` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub letter: SeriesLetter,
    pub expression: String,
}

/// Resolves panel targets into backend expressions.
pub struct TargetResolver<'a> {
    lookup: &'a dyn VariableLookup,
    scoped_vars: Option<&'a ScopedVars>,
}

impl<'a> TargetResolver<'a> {
    pub fn new(lookup: &'a dyn VariableLookup, scoped_vars: Option<&'a ScopedVars>) -> Self {
        Self {
            lookup,
            scoped_vars,
        }
    }

    /// Resolve all visible targets, in target order.
    pub fn resolve(&self, targets: &[QueryTarget]) -> Result<Vec<ResolvedTarget>> {
        let letters = LetterAssignment::assign(targets)?;
        let substituted = self.substitute(targets, &letters)?;
        expand_references(targets, &letters, &substituted)
    }

    /// Pass 1: interpolate variables and respell interval literals for every
    /// non-empty target, including hidden ones.
    pub fn substitute(
        &self,
        targets: &[QueryTarget],
        letters: &LetterAssignment,
    ) -> Result<SubstitutedTargets> {
        let mut substituted = BTreeMap::new();

        for (index, target) in targets.iter().enumerate() {
            if target.target.is_empty() {
                continue;
            }
            let Some(letter) = letters.letter(index) else {
                continue;
            };

            let interpolated = self.lookup.replace(&target.target, self.scoped_vars)?;
            substituted.insert(letter, fix_interval_format(&interpolated));
        }

        Ok(SubstitutedTargets(substituted))
    }
}

/// `'5m'` -> `'5min'`, `'1M'` -> `'1mon'`.
pub fn fix_interval_format(expression: &str) -> String {
    INTERVAL_LITERAL
        .replace_all(expression, |caps: &Captures| {
            let unit = if &caps[2] == "M" { "mon" } else { "min" };
            format!("'{}{}'", &caps[1], unit)
        })
        .into_owned()
}

/// Pass 2: rewrite back-references of visible targets against the pass 1
/// snapshot.
pub fn expand_references(
    targets: &[QueryTarget],
    letters: &LetterAssignment,
    substituted: &SubstitutedTargets,
) -> Result<Vec<ResolvedTarget>> {
    let mut expander = Expander::new(substituted);
    let mut resolved = Vec::new();

    for (index, target) in targets.iter().enumerate() {
        if target.target.is_empty() || target.hide {
            continue;
        }
        let Some(letter) = letters.letter(index) else {
            continue;
        };

        let expression = expander.expand(letter)?;
        resolved.push(ResolvedTarget { letter, expression });
    }

    Ok(resolved)
}

/// Expands back-references transitively, memoizing finished letters and
/// rejecting cycles.
struct Expander<'s> {
    snapshot: &'s SubstitutedTargets,
    expanded: HashMap<SeriesLetter, String>,
    in_progress: HashSet<SeriesLetter>,
}

impl<'s> Expander<'s> {
    fn new(snapshot: &'s SubstitutedTargets) -> Self {
        Self {
            snapshot,
            expanded: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    fn expand(&mut self, letter: SeriesLetter) -> Result<String> {
        if let Some(done) = self.expanded.get(&letter) {
            return Ok(done.clone());
        }
        if !self.in_progress.insert(letter) {
            return Err(DatasourceError::CyclicSeriesReference(letter));
        }

        let snapshot = self.snapshot;
        let raw = snapshot.get(letter).unwrap_or_default();

        let mut out = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in BACK_REFERENCE.captures_iter(raw) {
            let (Some(token), Some(reference)) = (caps.get(0), caps[1].chars().next()) else {
                continue;
            };
            let referenced = SeriesLetter::from_char(reference)
                .filter(|l| snapshot.contains(*l))
                .ok_or(DatasourceError::UnknownSeriesReference {
                    target: letter,
                    reference,
                })?;

            out.push_str(&raw[last..token.start()]);
            out.push_str(&self.expand(referenced)?);
            last = token.end();
        }
        out.push_str(&raw[last..]);

        self.in_progress.remove(&letter);
        self.expanded.insert(letter, out.clone());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::template::{TemplateError, TemplateVariables};

    fn targets(exprs: &[&str]) -> Vec<QueryTarget> {
        exprs.iter().map(|e| QueryTarget::new(e)).collect()
    }

    fn resolve(targets: &[QueryTarget]) -> Result<Vec<String>> {
        let lookup = TemplateVariables::new();
        let resolved = TargetResolver::new(&lookup, None).resolve(targets)?;
        Ok(resolved.into_iter().map(|t| t.expression).collect())
    }

    #[test]
    fn test_letters_are_assigned_by_position() {
        let letters = LetterAssignment::assign(&targets(&["a", "", "c"])).unwrap();
        assert_eq!(letters.len(), 3);
        assert_eq!(letters.letter(0).unwrap().as_char(), 'A');
        assert_eq!(letters.letter(1).unwrap().as_char(), 'B');
        assert_eq!(letters.letter(2).unwrap().as_char(), 'C');
        assert_eq!(letters.letter(3), None);

        assert!(!letters.is_empty());
        assert!(LetterAssignment::assign(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_more_than_26_targets_is_rejected() {
        let many: Vec<QueryTarget> = (0..27).map(|i| QueryTarget::new(&format!("m{i}"))).collect();
        let err = resolve(&many).unwrap_err();
        assert!(matches!(
            err,
            DatasourceError::TooManyTargets { count: 27, max: 26 }
        ));

        assert_eq!(resolve(&many[..26]).unwrap().len(), 26);
    }

    #[test]
    fn test_series_letter_round_trip() {
        let z = SeriesLetter::from_index(25).unwrap();
        assert_eq!(z.as_char(), 'Z');
        assert_eq!(SeriesLetter::from_char('Z'), Some(z));
        assert_eq!(SeriesLetter::from_char('a'), None);
        assert_eq!(SeriesLetter::from_index(26), None);
    }

    #[test]
    fn test_back_reference_is_substituted() {
        assert_eq!(
            resolve(&targets(&["cpu.load", "#A.max"])).unwrap(),
            vec!["cpu.load", "cpu.load.max"]
        );
    }

    #[test]
    fn test_hidden_target_is_referenceable_but_not_emitted() {
        let targets = vec![
            QueryTarget::hidden("servers.*.cpu"),
            QueryTarget::new("sumSeries(#A)"),
        ];
        assert_eq!(resolve(&targets).unwrap(), vec!["sumSeries(servers.*.cpu)"]);
    }

    #[test]
    fn test_forward_reference_is_satisfied() {
        assert_eq!(
            resolve(&targets(&["scale(#B, 2)", "cpu"])).unwrap(),
            vec!["scale(cpu, 2)", "cpu"]
        );
    }

    #[test]
    fn test_reference_chains_expand_transitively() {
        let targets = vec![
            QueryTarget::new("sumSeries(#B)"),
            QueryTarget::hidden("scale(#C, 2)"),
            QueryTarget::hidden("cpu.*"),
        ];
        assert_eq!(
            resolve(&targets).unwrap(),
            vec!["sumSeries(scale(cpu.*, 2))"]
        );
    }

    #[test]
    fn test_empty_targets_keep_their_letter() {
        assert_eq!(
            resolve(&targets(&["", "cpu", "#B.max"])).unwrap(),
            vec!["cpu", "cpu.max"]
        );
    }

    #[test]
    fn test_unknown_reference_is_an_error() {
        let err = resolve(&targets(&["cpu", "#Z"])).unwrap_err();
        match err {
            DatasourceError::UnknownSeriesReference { target, reference } => {
                assert_eq!(target.as_char(), 'B');
                assert_eq!(reference, 'Z');
            }
            other => panic!("expected UnknownSeriesReference, got {other:?}"),
        }

        // A letter that exists positionally but has an empty expression.
        assert!(matches!(
            resolve(&targets(&["", "#A"])),
            Err(DatasourceError::UnknownSeriesReference { .. })
        ));
    }

    #[test]
    fn test_cyclic_reference_is_an_error() {
        assert!(matches!(
            resolve(&targets(&["#B", "#A"])),
            Err(DatasourceError::CyclicSeriesReference(_))
        ));
        assert!(matches!(
            resolve(&targets(&["#A"])),
            Err(DatasourceError::CyclicSeriesReference(_))
        ));
    }

    #[test]
    fn test_interval_literals_are_respelled() {
        assert_eq!(
            fix_interval_format("summarize(cpu, '5m', 'sum')"),
            "summarize(cpu, '5min', 'sum')"
        );
        assert_eq!(
            fix_interval_format("summarize(cpu, '1M')"),
            "summarize(cpu, '1mon')"
        );
        assert_eq!(fix_interval_format("movingAverage(cpu, 5m)"), "movingAverage(cpu, 5m)");
        assert_eq!(fix_interval_format("'1h'"), "'1h'");
    }

    #[test]
    fn test_variables_are_interpolated_before_references() {
        let lookup = TemplateVariables::new().with("host", "web-01");
        let targets = targets(&["$host.cpu", "#A.max"]);
        let resolved = TargetResolver::new(&lookup, None).resolve(&targets).unwrap();
        assert_eq!(resolved[0].expression, "web-01.cpu");
        assert_eq!(resolved[1].expression, "web-01.cpu.max");
        assert_eq!(resolved[1].letter.as_char(), 'B');
    }

    /// Records the order in which expressions are looked up.
    struct RecordingLookup {
        calls: Mutex<Vec<String>>,
    }

    impl VariableLookup for RecordingLookup {
        fn replace(
            &self,
            expression: &str,
            _scoped_vars: Option<&ScopedVars>,
        ) -> std::result::Result<String, TemplateError> {
            self.calls.lock().unwrap().push(expression.to_string());
            Ok(expression.to_string())
        }
    }

    #[test]
    fn test_pass_one_completes_before_references_are_rewritten() {
        let lookup = RecordingLookup {
            calls: Mutex::new(Vec::new()),
        };
        let targets = vec![
            QueryTarget::new("#C.max"),
            QueryTarget::new(""),
            QueryTarget::hidden("summarize(cpu, '5m')"),
        ];
        let resolver = TargetResolver::new(&lookup, None);
        let letters = LetterAssignment::assign(&targets).unwrap();

        let snapshot = resolver.substitute(&targets, &letters).unwrap();
        assert_eq!(
            *lookup.calls.lock().unwrap(),
            vec!["#C.max".to_string(), "summarize(cpu, '5m')".to_string()]
        );
        // References are untouched by pass 1; hidden targets are present.
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.get(SeriesLetter::from_char('A').unwrap()), Some("#C.max"));
        assert_eq!(
            snapshot.get(SeriesLetter::from_char('C').unwrap()),
            Some("summarize(cpu, '5min')")
        );

        let resolved = expand_references(&targets, &letters, &snapshot).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].expression, "summarize(cpu, '5min').max");
    }

    struct FailingLookup;

    impl VariableLookup for FailingLookup {
        fn replace(
            &self,
            _expression: &str,
            _scoped_vars: Option<&ScopedVars>,
        ) -> std::result::Result<String, TemplateError> {
            Err(TemplateError::UnknownFormat {
                variable: "host".into(),
                format: "bogus".into(),
            })
        }
    }

    #[test]
    fn test_template_errors_propagate() {
        let err = TargetResolver::new(&FailingLookup, None)
            .resolve(&targets(&["$host"]))
            .unwrap_err();
        assert!(matches!(err, DatasourceError::Template(_)));
    }
}
