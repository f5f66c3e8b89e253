mod java;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// A single rule: if the callee signature equals (or ends with) one of the
/// `matchers`, the call gets `label`.
#[derive(Debug, Clone, Copy)]
pub struct LabelRule {
  pub matchers: &'static [&'static str],
  pub label:    DataLabel,
}

bitflags! {
    /// Taint categories. A value carries the union of the categories of
    /// every source it may derive from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Cap: u8 {
        const WEAK_RANDOM = 0b0000_0001;
        const USER_INPUT  = 0b0000_0010;
        const ENV_CONFIG  = 0b0000_0100;

        const UNTRUSTED   = Self::USER_INPUT.bits() | Self::ENV_CONFIG.bits();
    }
}

impl Cap {
  /// Human-readable category names, in bit order.
  pub fn describe(self) -> String {
    let mut parts = Vec::new();
    if self.contains(Cap::WEAK_RANDOM) {
      parts.push("non-cryptographic random");
    }
    if self.contains(Cap::USER_INPUT) {
      parts.push("user input");
    }
    if self.contains(Cap::ENV_CONFIG) {
      parts.push("environment/config read");
    }
    if parts.is_empty() {
      return "untainted".into();
    }
    parts.join(", ")
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLabel {
  Source(Cap),
  Sanitizer(Cap),
}

static REGISTRY: Lazy<HashMap<&'static str, &'static [LabelRule]>> = Lazy::new(|| {
  let mut m = HashMap::new();
  m.insert("java",   java::RULES);
  m.insert("jvm",    java::RULES);
  m.insert("kotlin", java::RULES);

  tracing::debug!("source taxonomy initialised ({} languages)", m.len());
  m
});

/// Try to classify a callee signature.
/// `lang` is the front-end's language key (“java”, “kotlin”, …).
pub fn classify(lang: &str, callee: &str) -> Option<DataLabel> {
  let key     = lang.to_ascii_lowercase();
  let rules   = REGISTRY.get(key.as_str())?;
  let head    = callee.split('(').next().unwrap_or("");

  let text_lc = head.trim().to_ascii_lowercase();

  for rule in *rules {
    for raw in rule.matchers {
      let m = raw.to_ascii_lowercase();

      if text_lc.ends_with(&m) {
        let start = text_lc.len() - m.len();
        let ok = start == 0
          || matches!(text_lc.as_bytes()[start - 1], b'.' | b'$');
        if ok {
          return Some(rule.label);
        }
      }
    }
  }
  None
}

#[test]
fn classify_respects_name_boundaries() {
  assert_eq!(
    classify("java", "java.util.Random.<init>"),
    Some(DataLabel::Source(Cap::WEAK_RANDOM))
  );
  // SecureRandom must not be mistaken for Random.
  assert_eq!(classify("java", "java.security.SecureRandom.<init>"), None);
  assert_eq!(
    classify("java", "java.util.Random.nextLong"),
    Some(DataLabel::Source(Cap::WEAK_RANDOM))
  );
  assert_eq!(classify("java", "java.security.SecureRandom.nextLong"), None);
  assert_eq!(
    classify("JAVA", "javax.servlet.http.HttpServletRequest.getParameter(Ljava/lang/String;)"),
    Some(DataLabel::Source(Cap::USER_INPUT))
  );
  assert_eq!(
    classify("java", "java.lang.System.getenv"),
    Some(DataLabel::Source(Cap::ENV_CONFIG))
  );
  assert!(matches!(
    classify("java", "java.lang.Integer.parseInt"),
    Some(DataLabel::Sanitizer(_))
  ));
  assert_eq!(classify("cobol", "java.lang.System.getenv"), None);
}

#[test]
fn describe_lists_every_category() {
  assert_eq!(Cap::empty().describe(), "untainted");
  assert_eq!(
    Cap::UNTRUSTED.describe(),
    "user input, environment/config read"
  );
}
