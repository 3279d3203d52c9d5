//! Keyword rules.
//!
//! A rule is either a plain keyword, matched as a case-insensitive substring,
//! or an expression in a small boolean language:
//!
//! ```text
//! rule    := group ('|' group)*        any group may match
//! group   := term ('+' term)*          every term must match
//! term    := literal ('~' literal)*    first literal required, the rest forbidden
//! ```
//!
//! Rules containing regex metacharacters are additionally tried as a
//! case-insensitive regular expression; the rule matches when either
//! reading does.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::{Regex, RegexBuilder};

const SPECIAL_CHARS: &[char] = &[
    '^', '$', '.', '*', '+', '?', '(', ')', '[', ']', '{', '}', '|', '\\', '~',
];

#[derive(Debug)]
pub struct Rule {
    kind: RuleKind,
}

#[derive(Debug)]
enum RuleKind {
    Plain(String),
    Expression {
        groups: Vec<Group>,
        regex: Option<Regex>,
    },
}

#[derive(Debug)]
struct Group {
    terms: Vec<Term>,
}

#[derive(Debug)]
struct Term {
    include: String,
    exclude: Vec<String>,
}

impl Term {
    fn is_satisfied(&self, title: &str) -> bool {
        (self.include.is_empty() || title.contains(&self.include))
            && !self
                .exclude
                .iter()
                .any(|word| !word.is_empty() && title.contains(word.as_str()))
    }
}

impl Group {
    fn is_satisfied(&self, title: &str) -> bool {
        self.terms.iter().all(|term| term.is_satisfied(title))
    }
}

impl Rule {
    pub fn compile(rule: &str) -> Self {
        let lowered = rule.trim().to_lowercase();

        if !lowered.contains(SPECIAL_CHARS) {
            return Self {
                kind: RuleKind::Plain(lowered),
            };
        }

        let groups = lowered
            .split('|')
            .map(|group| Group {
                terms: group
                    .split('+')
                    .map(|term| {
                        let mut parts = term.split('~').map(str::trim);
                        Term {
                            include: parts.next().unwrap_or_default().to_string(),
                            exclude: parts.map(str::to_string).collect(),
                        }
                    })
                    .collect(),
            })
            .collect();

        let regex = match RegexBuilder::new(rule.trim()).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::debug!(rule, error = %e, "keyword rule is not a valid regex");
                None
            }
        };

        Self {
            kind: RuleKind::Expression { groups, regex },
        }
    }

    pub fn is_match(&self, title: &str) -> bool {
        self.is_match_lowered(&title.to_lowercase(), title)
    }

    fn is_match_lowered(&self, lowered: &str, original: &str) -> bool {
        match &self.kind {
            RuleKind::Plain(keyword) => lowered.contains(keyword.as_str()),
            RuleKind::Expression { groups, regex } => {
                groups.iter().any(|group| group.is_satisfied(lowered))
                    || regex.as_ref().is_some_and(|re| re.is_match(original))
            }
        }
    }
}

/// Compiles rules on first use and keeps them for the life of the process.
#[derive(Debug, Default)]
pub struct KeywordMatcher {
    compiled: RwLock<HashMap<String, Arc<Rule>>>,
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(&self, rule: &str) -> Arc<Rule> {
        if let Ok(compiled) = self.compiled.read() {
            if let Some(found) = compiled.get(rule) {
                return Arc::clone(found);
            }
        }

        let fresh = Arc::new(Rule::compile(rule));
        match self.compiled.write() {
            Ok(mut compiled) => Arc::clone(compiled.entry(rule.to_string()).or_insert(fresh)),
            Err(_) => fresh,
        }
    }

    pub fn rules(&self, rules: &[String]) -> RuleSet {
        RuleSet {
            rules: rules.iter().map(|r| self.rule(r)).collect(),
        }
    }

    pub fn is_match(&self, title: &str, rule: &str) -> bool {
        self.rule(rule).is_match(title)
    }

    pub fn cached_rules(&self) -> usize {
        self.compiled.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// All rules of one subscription; matches when any rule does.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_match(&self, title: &str) -> bool {
        let lowered = title.to_lowercase();
        self.rules
            .iter()
            .any(|rule| rule.is_match_lowered(&lowered, title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(title: &str, rule: &str) -> bool {
        Rule::compile(rule).is_match(title)
    }

    #[test]
    fn plain_keywords_are_case_insensitive_substrings() {
        assert!(matches("油管 YouTube Premium家庭组 任意区年66.99", "youtube"));
        assert!(matches("this is iPhone", "IPHONE"));
        assert!(!matches("this is android", "iphone"));

        for (title, rule) in [
            ("Selling a VPS in HK", "vps"),
            ("Selling a VPS in HK", "in hk"),
            ("Selling a VPS in HK", "tokyo"),
            ("[收]斯巴达小鸡一个", "斯巴达"),
            ("", "x"),
        ] {
            assert_eq!(
                matches(title, rule),
                title.to_lowercase().contains(&rule.to_lowercase()),
                "{title} / {rule}"
            );
        }
    }

    #[test]
    fn negation_excludes_titles() {
        assert!(!matches("[收]斯巴达小鸡一个", "斯巴达~收"));
        assert!(matches("[出]这是斯巴达", "斯巴达~收"));
        assert!(!matches("剩余价值push出港仔CMHK NAT 续费", "港仔~NAT"));
    }

    #[test]
    fn alternatives_and_conjunctions() {
        assert!(matches("我喜欢苹果手机", "苹果|安卓"));
        assert!(matches("我喜欢听这个iPhone的信息频道", "iPhone+频道"));
        assert!(!matches("我喜欢听这个iPhone的信息", "iPhone+频道"));
        assert!(!matches("", "斯巴达~收+小鸡"));
        assert!(matches("出斯巴达小鸡", "斯巴达~收+小鸡"));
        assert!(matches("hk nat", "tokyo | HK + nat"));
    }

    #[test]
    fn leading_tilde_is_pure_negation() {
        assert!(matches("出港仔", "~收"));
        assert!(!matches("收港仔", "~收"));
    }

    #[test]
    fn empty_literals_are_ignored() {
        assert!(matches("港仔出NAT", "港仔+ "));
        assert!(matches("港仔出NAT", "港仔~"));
    }

    #[test]
    fn regex_reading_is_tried_directly() {
        assert!(matches("bgp.gd 特价", "bgp.gd"));
        assert!(matches("Price 13.88u/月", r"\d+\.\d+u"));
        assert!(matches("剩余价值push出港仔CMHK", "(港仔|ggy|claw)"));
        assert!(matches("CLAW cloud", "^claw"));
    }

    #[test]
    fn invalid_regex_still_uses_expression_reading() {
        assert!(matches("港仔(出)NAT", "港仔+(出"));
        assert!(!matches("港仔NAT", "港仔+(出"));
        // lookarounds are not supported by the regex engine
        assert!(!matches("港仔出", "(?=.*港仔)(?=.*出)"));
    }

    #[test]
    fn rule_sets_match_when_any_rule_does() {
        let matcher = KeywordMatcher::new();
        let rules = vec!["bgp".to_string(), "港仔~NAT".to_string(), "mk".to_string()];
        let set = matcher.rules(&rules);

        assert!(!set.is_match("剩余价值➕push出港仔CMHK NAT 续费 13.88u/月"));
        assert!(set.is_match("港仔 CMHK"));
        assert!(set.is_match("MK server"));
        assert!(!matcher.rules(&[]).is_match("anything"));
    }

    #[test]
    fn compiled_rules_are_cached_by_text() {
        let matcher = KeywordMatcher::new();
        let first = matcher.rule("a|b");
        let second = matcher.rule("a|b");
        matcher.rule("c");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(matcher.cached_rules(), 2);
        assert!(matcher.is_match("B side", "a|b"));
    }
}
