//! Interception policy shared between the engine and its operator surface.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;

/// A substring matcher that forces interception of matching flows.
///
/// The pattern is tested case-insensitively against the request method,
/// host and URL; rules keep their insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRule {
  /// Rule identifier, unique within a controller.
  pub id: i64,
  /// Disabled rules never match.
  pub enabled: bool,
  /// Substring to look for; an empty pattern never matches.
  pub pattern: String,
}

/// Process-wide mutable interception policy.
///
/// Reads happen on every request, writes only on operator actions, so the
/// intercept flag is an atomic and the rule list sits behind a
/// read/write lock.
#[derive(Debug, Default)]
pub struct Controller {
  intercept: AtomicBool,
  next_rule_id: AtomicI64,
  rules: RwLock<Vec<BreakpointRule>>,
}

impl Controller {
  /// Create a controller with interception off and no rules.
  pub fn new() -> Self {
    Controller::default()
  }

  /// Whether global interception is on.
  pub fn intercept_enabled(&self) -> bool {
    self.intercept.load(Ordering::SeqCst)
  }

  /// Turn global interception on or off.
  pub fn set_intercept(&self, on: bool) {
    self.intercept.store(on, Ordering::SeqCst);
  }

  /// Add a rule matching `pattern` (trimmed), enabled by default.
  pub fn add_breakpoint(&self, pattern: &str) -> BreakpointRule {
    let rule = BreakpointRule {
      id: self.next_rule_id.fetch_add(1, Ordering::SeqCst) + 1,
      enabled: true,
      pattern: pattern.trim().to_string(),
    };
    if let Ok(mut rules) = self.rules.write() {
      rules.push(rule.clone());
    }
    rule
  }

  /// A snapshot copy of the rules in insertion order.
  pub fn list_breakpoints(&self) -> Vec<BreakpointRule> {
    match self.rules.read() {
      Ok(rules) => rules.clone(),
      Err(_) => Vec::new(),
    }
  }

  /// Flip the enabled flag of the first rule with `id`. Returns whether a
  /// rule was found.
  pub fn toggle_breakpoint(&self, id: i64) -> bool {
    let Ok(mut rules) = self.rules.write() else {
      return false;
    };
    match rules.iter_mut().find(|r| r.id == id) {
      Some(rule) => {
        rule.enabled = !rule.enabled;
        true
      }
      None => false,
    }
  }

  /// Remove the first rule with `id`. Returns whether a rule was found.
  pub fn remove_breakpoint(&self, id: i64) -> bool {
    let Ok(mut rules) = self.rules.write() else {
      return false;
    };
    match rules.iter().position(|r| r.id == id) {
      Some(index) => {
        rules.remove(index);
        true
      }
      None => false,
    }
  }

  /// True when any enabled rule's non-empty pattern is a case-insensitive
  /// substring of the method, URL or host.
  pub fn should_break(&self, method: &str, url: &str, host: &str) -> bool {
    let Ok(rules) = self.rules.read() else {
      return false;
    };
    if rules.is_empty() {
      return false;
    }
    let method = method.to_lowercase();
    let url = url.to_lowercase();
    let host = host.to_lowercase();
    rules.iter().any(|rule| {
      if !rule.enabled || rule.pattern.is_empty() {
        return false;
      }
      let pattern = rule.pattern.to_lowercase();
      method.contains(&pattern) || url.contains(&pattern) || host.contains(&pattern)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intercept_toggle() {
    let ctrl = Controller::new();
    assert!(!ctrl.intercept_enabled());
    ctrl.set_intercept(true);
    assert!(ctrl.intercept_enabled());
    ctrl.set_intercept(false);
    assert!(!ctrl.intercept_enabled());
  }

  #[test]
  fn rule_ids_are_monotonic() {
    let ctrl = Controller::new();
    let a = ctrl.add_breakpoint("a");
    let b = ctrl.add_breakpoint("b");
    let c = ctrl.add_breakpoint("c");
    assert!(a.id < b.id && b.id < c.id);
    let listed: Vec<i64> = ctrl.list_breakpoints().iter().map(|r| r.id).collect();
    assert_eq!(listed, vec![a.id, b.id, c.id]);
  }

  #[test]
  fn patterns_are_trimmed() {
    let ctrl = Controller::new();
    let rule = ctrl.add_breakpoint("  login  ");
    assert_eq!(rule.pattern, "login");
  }

  #[test]
  fn break_matches_any_field_case_insensitively() {
    let ctrl = Controller::new();
    ctrl.add_breakpoint("LOGIN");
    assert!(ctrl.should_break("POST", "http://example.test/login", "example.test"));
    assert!(ctrl.should_break("GET", "http://x/", "login.example.test"));
    assert!(!ctrl.should_break("GET", "http://x/", "example.test"));
    // method matching
    ctrl.add_breakpoint("delete");
    assert!(ctrl.should_break("DELETE", "http://x/", "example.test"));
  }

  #[test]
  fn empty_and_disabled_rules_never_match() {
    let ctrl = Controller::new();
    ctrl.add_breakpoint("   ");
    assert!(!ctrl.should_break("GET", "http://x/", "h"));
    let rule = ctrl.add_breakpoint("x");
    ctrl.toggle_breakpoint(rule.id);
    assert!(!ctrl.should_break("GET", "http://x/", "h"));
    ctrl.toggle_breakpoint(rule.id);
    assert!(ctrl.should_break("GET", "http://x/", "h"));
  }

  #[test]
  fn remove_breakpoint_drops_first_match() {
    let ctrl = Controller::new();
    let a = ctrl.add_breakpoint("a");
    let b = ctrl.add_breakpoint("b");
    assert!(ctrl.remove_breakpoint(a.id));
    assert!(!ctrl.remove_breakpoint(a.id));
    assert_eq!(ctrl.list_breakpoints(), vec![b]);
  }

  #[test]
  fn no_rules_never_breaks() {
    let ctrl = Controller::new();
    assert!(!ctrl.should_break("GET", "http://example.test/", "example.test"));
  }
}
