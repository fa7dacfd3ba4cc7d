use log::debug;

use crate::error::BoxError;

/// Set, remove or inherit one environment variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRule {
  pub name: String,
  /// `None` inherits the value of the caller, `""` removes the variable
  pub value: Option<String>,
}

impl EnvRule {
  pub fn new<S: Into<String>>(name: S, value: Option<S>) -> Self {
    EnvRule {
      name: name.into(),
      value: value.map(|v| v.into()),
    }
  }

  /// Parse `var` or `var=value`
  pub fn parse(text: &str) -> Result<Self, BoxError> {
    let (name, value) = match text.split_once('=') {
      Some((name, value)) => (name, Some(value)),
      None => (text, None),
    };
    if name.is_empty() {
      return Err(BoxError::config(format!(
        "Empty variable name in `{}`",
        text
      )));
    }
    Ok(EnvRule::new(name, value))
  }

  /// Apply this rule to `env`, the variable ends up last if it is kept
  pub fn apply(&self, env: &mut Vec<(String, String)>, caller: &[(String, String)]) {
    env.retain(|(key, _)| key != &self.name);
    let value = match &self.value {
      Some(value) if value.is_empty() => return,
      Some(value) => value.clone(),
      None => match caller.iter().find(|(key, _)| key == &self.name) {
        Some((_, value)) => value.clone(),
        None => return,
      },
    };
    env.push((self.name.clone(), value));
  }
}

/// Rules applied before any user rule
pub fn builtin_env_rules() -> Vec<EnvRule> {
  vec![EnvRule::new("LIBC_FATAL_STDERR_", Some("1"))]
}

/// Environment of the sandboxed program.
///
/// Starts empty, or from the whole caller environment when `inherit` is set, then
/// the built-in rules and `rules` are applied in order.
pub fn build_environment(
  inherit: bool,
  rules: &[EnvRule],
  caller: &[(String, String)],
) -> Vec<(String, String)> {
  let mut env = if inherit { caller.to_vec() } else { vec![] };
  for rule in builtin_env_rules().iter().chain(rules.iter()) {
    rule.apply(&mut env, caller);
  }
  debug!("Environment has {} variables", env.len());
  env
}
