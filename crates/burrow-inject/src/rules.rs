//! Compiled injection rules and their selection per request

use burrow_proto::ScriptInjection;
use regex::Regex;
use tracing::warn;

use crate::InjectError;

/// A [`ScriptInjection`] with its `pathRegex` compiled
#[derive(Debug, Clone)]
pub struct InjectionRule {
    spec: ScriptInjection,
    path_regex: Option<Regex>,
}

impl InjectionRule {
    pub fn compile(spec: ScriptInjection) -> Result<Self, InjectError> {
        let path_regex = match spec.path_regex.as_deref() {
            Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                InjectError::InvalidPathRegex {
                    pattern: pattern.to_string(),
                    source,
                }
            })?),
            None => None,
        };
        Ok(Self { spec, path_regex })
    }

    pub fn spec(&self) -> &ScriptInjection {
        &self.spec
    }

    /// Whether this rule applies to a request `path` on a forward of `port`
    pub fn applies(&self, path: &str, port: Option<u16>) -> bool {
        if let Some(wanted) = self.spec.port {
            if port != Some(wanted) {
                return false;
            }
        }
        self.path_regex
            .as_ref()
            .map_or(true, |regex| regex.is_match(path))
    }
}

/// An ordered list of rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<InjectionRule>,
}

impl RuleSet {
    pub fn compile(specs: Vec<ScriptInjection>) -> Result<Self, InjectError> {
        let rules = specs
            .into_iter()
            .map(InjectionRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Compile what compiles, logging and dropping the rest
    pub fn compile_lenient(specs: Vec<ScriptInjection>) -> Self {
        let rules = specs
            .into_iter()
            .filter_map(|spec| match InjectionRule::compile(spec) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Ignoring injection rule: {}", e);
                    None
                }
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ScriptInjection> {
        self.rules.iter().map(InjectionRule::spec)
    }

    /// Scripts applying to this request, in rule order
    pub fn select(&self, path: &str, port: Option<u16>) -> Vec<ScriptInjection> {
        self.rules
            .iter()
            .filter(|rule| rule.applies(path, port))
            .map(|rule| rule.spec.clone())
            .collect()
    }
}

/// Effective scripts for a request: global, then per-forward, then per-request
pub fn select_all(sets: &[&RuleSet], path: &str, port: Option<u16>) -> Vec<ScriptInjection> {
    sets.iter()
        .flat_map(|set| set.select(path, port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_port_filters() {
        let rules = RuleSet::compile(vec![
            ScriptInjection::new("all.js"),
            ScriptInjection::new("app.js").with_path_regex("^/app"),
            ScriptInjection::new("web.js").with_port(80),
        ])
        .unwrap();

        let srcs = |path, port| {
            rules
                .select(path, port)
                .into_iter()
                .map(|s| s.src)
                .collect::<Vec<_>>()
        };
        assert_eq!(srcs("/", Some(80)), ["all.js", "web.js"]);
        assert_eq!(srcs("/app/x", Some(3000)), ["all.js", "app.js"]);
        assert_eq!(srcs("/app", None), ["all.js", "app.js"]);
    }

    #[test]
    fn test_invalid_regex() {
        let err = RuleSet::compile(vec![ScriptInjection::new("x.js").with_path_regex("(")])
            .unwrap_err();
        assert!(matches!(err, InjectError::InvalidPathRegex { .. }));

        let lenient = RuleSet::compile_lenient(vec![
            ScriptInjection::new("x.js").with_path_regex("("),
            ScriptInjection::new("y.js"),
        ]);
        assert_eq!(lenient.len(), 1);
    }

    #[test]
    fn test_select_all_keeps_order() {
        let global = RuleSet::compile(vec![ScriptInjection::new("g.js")]).unwrap();
        let tunnel = RuleSet::compile(vec![ScriptInjection::new("t.js")]).unwrap();
        let header = RuleSet::compile(vec![ScriptInjection::new("h.js")]).unwrap();

        let srcs: Vec<_> = select_all(&[&global, &tunnel, &header], "/", None)
            .into_iter()
            .map(|s| s.src)
            .collect();
        assert_eq!(srcs, ["g.js", "t.js", "h.js"]);
    }
}
