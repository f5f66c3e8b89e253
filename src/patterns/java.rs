use crate::facts::{Fact, FactBody, FactKind};
use crate::ir::Literal;
use crate::labels::Cap;
use crate::patterns::{
    Confidence, Dedupe, MatchCtx, Rule, RuleKind, Severity, SinkOperands, TaintRequirement,
};
use phf::{Map, Set, phf_map, phf_set};

const FSB: &str = "https://find-sec-bugs.github.io/bugs.htm";
const SPOTBUGS: &str = "https://spotbugs.readthedocs.io/en/latest/bugDescriptions.html";

pub static RULES: &[Rule] = &[
    Rule {
        id: "insecure-cipher-mode",
        bug_type: "ECB_MODE",
        description: "Cipher transformation uses ECB mode (explicitly or by default)",
        message: "{callee} is called with {arg0}, which encrypts in ECB mode",
        severity: Severity::SecurityHigh,
        confidence: Confidence::High,
        cwe: Some(327),
        reference: FSB,
        fact_kind: FactKind::Call,
        kind: RuleKind::Structural,
        matcher: insecure_cipher_mode,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "hardcoded-credential",
        bug_type: "DMI_CONSTANT_DB_PASSWORD",
        description: "Credential argument is a hardcoded constant",
        message: "{callee} receives a hardcoded credential",
        severity: Severity::SecurityHigh,
        confidence: Confidence::High,
        cwe: Some(259),
        reference: SPOTBUGS,
        fact_kind: FactKind::Call,
        kind: RuleKind::Structural,
        matcher: hardcoded_credential,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "empty-db-password",
        bug_type: "DMI_EMPTY_DB_PASSWORD",
        description: "Database connection is opened with an empty password",
        message: "{callee} is called with an empty password",
        severity: Severity::Warning,
        confidence: Confidence::High,
        cwe: Some(521),
        reference: SPOTBUGS,
        fact_kind: FactKind::Call,
        kind: RuleKind::Structural,
        matcher: empty_db_password,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "weak-message-digest",
        bug_type: "WEAK_MESSAGE_DIGEST_MD5",
        description: "MessageDigest uses a broken hash algorithm",
        message: "{callee} is called with the weak algorithm {arg0}",
        severity: Severity::Warning,
        confidence: Confidence::High,
        cwe: Some(328),
        reference: FSB,
        fact_kind: FactKind::Call,
        kind: RuleKind::Structural,
        matcher: weak_message_digest,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "weak-random-token",
        bug_type: "PREDICTABLE_RANDOM",
        description: "Security token derived from a non-cryptographic random generator",
        message: "{unit} returns a value derived from {source}; use java.security.SecureRandom",
        severity: Severity::SecurityHigh,
        confidence: Confidence::Medium,
        cwe: Some(330),
        reference: FSB,
        fact_kind: FactKind::Return,
        kind: RuleKind::Taint(TaintRequirement {
            sources: Cap::WEAK_RANDOM,
            sink: SinkOperands::ReturnValue,
        }),
        matcher: returns_from_token_method,
        dedupe: Dedupe::PerUnit,
    },
    Rule {
        id: "sql-injection",
        bug_type: "SQL_INJECTION_JDBC",
        description: "Query built from untrusted input reaches a SQL execution call",
        message: "{callee} executes a query built from {source}",
        severity: Severity::SecurityHigh,
        confidence: Confidence::High,
        cwe: Some(89),
        reference: FSB,
        fact_kind: FactKind::Call,
        kind: RuleKind::Taint(TaintRequirement {
            sources: Cap::UNTRUSTED,
            sink: SinkOperands::Arg(0),
        }),
        matcher: sql_sink,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "command-injection",
        bug_type: "COMMAND_INJECTION",
        description: "Untrusted input reaches process execution",
        message: "{callee} runs a command built from {source}",
        severity: Severity::SecurityHigh,
        confidence: Confidence::High,
        cwe: Some(78),
        reference: FSB,
        fact_kind: FactKind::Call,
        kind: RuleKind::Taint(TaintRequirement {
            sources: Cap::UNTRUSTED,
            sink: SinkOperands::AnyArg,
        }),
        matcher: command_sink,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "path-traversal",
        bug_type: "PATH_TRAVERSAL_IN",
        description: "User input used to build a file path",
        message: "{callee} opens a path built from {source}",
        severity: Severity::Warning,
        confidence: Confidence::Medium,
        cwe: Some(22),
        reference: FSB,
        fact_kind: FactKind::Call,
        kind: RuleKind::Taint(TaintRequirement {
            sources: Cap::USER_INPUT,
            sink: SinkOperands::AnyArg,
        }),
        matcher: path_sink,
        dedupe: Dedupe::PerSink,
    },
    Rule {
        id: "nullable-boxed-return",
        bug_type: "NP_BOOLEAN_RETURN_NULL",
        description: "Method with a boxed Boolean return type returns null",
        message: "{unit} has Boolean return type and returns explicit null",
        severity: Severity::Warning,
        confidence: Confidence::High,
        cwe: Some(476),
        reference: SPOTBUGS,
        fact_kind: FactKind::Return,
        kind: RuleKind::Structural,
        matcher: boxed_boolean_returns_null,
        dedupe: Dedupe::PerSink,
    },
];

// ─────────── tables ───────────

static BLOCK_CIPHERS: Set<&'static str> = phf_set! {
    "AES", "DES", "DESEDE", "TRIPLEDES", "BLOWFISH", "RC2", "RC5", "IDEA", "SEED", "CAMELLIA",
};

static WEAK_DIGESTS: Set<&'static str> = phf_set! {
    "MD2", "MD4", "MD5", "SHA", "SHA1", "SHA-1",
};

/// Credential-bearing call → index of the password argument.
static CREDENTIAL_SINKS: Map<&'static str, usize> = phf_map! {
    "java.sql.DriverManager.getConnection" => 2,
    "javax.sql.DataSource.getConnection" => 1,
    "java.net.PasswordAuthentication.<init>" => 1,
    "javax.crypto.spec.PBEKeySpec.<init>" => 0,
    "javax.security.auth.kerberos.KerberosKey.<init>" => 1,
};

static SQL_SINKS: Set<&'static str> = phf_set! {
    "java.sql.Statement.execute",
    "java.sql.Statement.executeQuery",
    "java.sql.Statement.executeUpdate",
    "java.sql.Statement.executeLargeUpdate",
    "java.sql.Statement.addBatch",
    "java.sql.Connection.prepareStatement",
    "java.sql.Connection.prepareCall",
    "javax.persistence.EntityManager.createQuery",
    "javax.persistence.EntityManager.createNativeQuery",
    "org.springframework.jdbc.core.JdbcTemplate.query",
    "org.springframework.jdbc.core.JdbcTemplate.queryForList",
    "org.springframework.jdbc.core.JdbcTemplate.update",
};

static COMMAND_SINKS: Set<&'static str> = phf_set! {
    "java.lang.Runtime.exec",
    "java.lang.ProcessBuilder.<init>",
    "java.lang.ProcessBuilder.command",
};

static PATH_SINKS: Set<&'static str> = phf_set! {
    "java.io.File.<init>",
    "java.io.FileInputStream.<init>",
    "java.io.FileOutputStream.<init>",
    "java.io.FileReader.<init>",
    "java.io.FileWriter.<init>",
    "java.io.RandomAccessFile.<init>",
    "java.nio.file.Paths.get",
};

/// Words of a method name that mark it as producing secret material. Two
/// adjacent words may join to form one (`getApiKey` has `apikey`).
const TOKEN_HINTS: &[&str] = &[
    "token", "secret", "password", "passwd", "nonce", "salt", "session", "otp", "apikey", "csrf",
];

// ─────────── matchers ───────────

/// `true` when a `Cipher.getInstance` transformation ends up in ECB mode.
pub(crate) fn is_ecb_transformation(transformation: &str) -> bool {
    let mut parts = transformation.split('/');
    let algorithm = parts.next().unwrap_or("").trim().to_ascii_uppercase();
    match parts.next() {
        // provider default for block ciphers is ECB
        None => BLOCK_CIPHERS.contains(algorithm.as_str()),
        Some(mode) => {
            mode.trim().eq_ignore_ascii_case("ECB") && BLOCK_CIPHERS.contains(algorithm.as_str())
        }
    }
}

fn insecure_cipher_mode(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    f.callee() == Some("javax.crypto.Cipher.getInstance")
        && f.args()
            .first()
            .and_then(|a| ctx.literal_of(a))
            .and_then(Literal::as_str)
            .is_some_and(is_ecb_transformation)
}

fn credential_literal<'a>(f: &'a Fact, ctx: &'a MatchCtx<'_>) -> Option<&'a str> {
    let idx = CREDENTIAL_SINKS.get(f.callee()?)?;
    let arg = f.args().get(*idx)?;
    ctx.literal_of(arg).and_then(Literal::as_str)
}

fn hardcoded_credential(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    credential_literal(f, ctx).is_some_and(|s| !s.is_empty())
}

fn empty_db_password(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    f.callee().is_some_and(|c| c.ends_with(".getConnection"))
        && credential_literal(f, ctx).is_some_and(str::is_empty)
}

fn weak_message_digest(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    f.callee() == Some("java.security.MessageDigest.getInstance")
        && f.args()
            .first()
            .and_then(|a| ctx.literal_of(a))
            .and_then(Literal::as_str)
            .is_some_and(|alg| WEAK_DIGESTS.contains(alg.to_ascii_uppercase().as_str()))
}

/// Split an identifier into lowercase words at camel-case humps, digit runs
/// and non-alphanumeric separators. `OTPCode2` gives `otp`, `code`, `2`.
fn name_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut cur = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !cur.is_empty() {
                words.push(std::mem::take(&mut cur));
            }
            continue;
        }
        if let Some(&prev) = i.checked_sub(1).and_then(|j| chars.get(j)) {
            let next_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            let hump = c.is_ascii_uppercase()
                && (prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_lower));
            let digits = prev.is_ascii_alphanumeric() && c.is_ascii_digit() != prev.is_ascii_digit();
            if (hump || digits) && !cur.is_empty() {
                words.push(std::mem::take(&mut cur));
            }
        }
        cur.push(c.to_ascii_lowercase());
    }
    if !cur.is_empty() {
        words.push(cur);
    }
    words
}

pub(crate) fn is_token_method(name: &str) -> bool {
    let words = name_words(name);
    words.iter().any(|w| TOKEN_HINTS.contains(&w.as_str()))
        || words
            .windows(2)
            .any(|pair| TOKEN_HINTS.contains(&pair.concat().as_str()))
}

fn returns_from_token_method(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    matches!(&f.body, FactBody::Return { value: Some(_) }) && is_token_method(ctx.unit.simple_name())
}

fn sql_sink(f: &Fact, _: &MatchCtx<'_>) -> bool {
    f.callee().is_some_and(|c| SQL_SINKS.contains(c))
}

fn command_sink(f: &Fact, _: &MatchCtx<'_>) -> bool {
    f.callee().is_some_and(|c| COMMAND_SINKS.contains(c))
}

fn path_sink(f: &Fact, _: &MatchCtx<'_>) -> bool {
    f.callee().is_some_and(|c| PATH_SINKS.contains(c))
}

fn boxed_boolean_returns_null(f: &Fact, ctx: &MatchCtx<'_>) -> bool {
    let boxed = matches!(
        ctx.unit.return_type.as_str(),
        "java.lang.Boolean" | "Boolean"
    );
    boxed
        && match &f.body {
            FactBody::Return { value: Some(arg) } => ctx.may_be_literal(arg, Literal::is_null),
            _ => false,
        }
}

#[test]
fn ecb_detection_covers_explicit_and_default_modes() {
    assert!(is_ecb_transformation("AES/ECB/NoPadding"));
    assert!(is_ecb_transformation("aes/ecb/PKCS5Padding"));
    assert!(is_ecb_transformation("AES"));
    assert!(is_ecb_transformation("DESede"));
    assert!(!is_ecb_transformation("AES/GCM/NoPadding"));
    assert!(!is_ecb_transformation("AES/CBC/PKCS5Padding"));
    // RSA "ECB" is a naming artefact, not block chaining
    assert!(!is_ecb_transformation("RSA/ECB/OAEPWithSHA-256AndMGF1Padding"));
}

#[test]
fn token_heuristic_matches_secret_producers() {
    assert!(is_token_method("generateSecretToken1"));
    assert!(is_token_method("newSessionId"));
    assert!(is_token_method("makeCsrfValue"));
    assert!(is_token_method("getOtp"));
    assert!(is_token_method("OTPCode"));
    assert!(is_token_method("getApiKey"));
    assert!(is_token_method("reset_password_hash"));
    assert!(!is_token_method("nextRandomLong"));
    assert!(!is_token_method("main"));
}

#[test]
fn token_heuristic_needs_whole_words() {
    assert!(!is_token_method("footprint"));
    assert!(!is_token_method("hotPath"));
    assert!(!is_token_method("computeSaltwaterRatio"));
    assert!(!is_token_method("tokenizer"));
    assert!(!is_token_method("<init>"));
}

#[test]
fn name_words_split_on_humps_and_digits() {
    assert_eq!(name_words("generateSecretToken1"), vec!["generate", "secret", "token", "1"]);
    assert_eq!(name_words("OTPCode"), vec!["otp", "code"]);
    assert_eq!(name_words("lambda$make_nonce$0"), vec!["lambda", "make", "nonce", "0"]);
}
