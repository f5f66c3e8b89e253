use crate::labels::{Cap, DataLabel, LabelRule};

pub static RULES: &[LabelRule] = &[
    // ─────────── Sources ───────────
    LabelRule {
        matchers: &[
            "java.util.Random.<init>",
            // instance draws, for generators held in fields or passed in
            "java.util.Random.nextInt",
            "java.util.Random.nextLong",
            "java.util.Random.nextDouble",
            "java.util.Random.nextFloat",
            "java.util.Random.nextBoolean",
            "java.util.Random.nextBytes",
            "java.util.Random.nextGaussian",
            "java.util.Random.ints",
            "java.util.Random.longs",
            "java.lang.Math.random",
            "java.util.concurrent.ThreadLocalRandom.current",
            "org.apache.commons.lang3.RandomUtils.nextLong",
            "org.apache.commons.lang3.RandomStringUtils.randomAlphanumeric",
        ],
        label: DataLabel::Source(Cap::WEAK_RANDOM),
    },
    LabelRule {
        matchers: &[
            "ServletRequest.getParameter",
            "ServletRequest.getParameterValues",
            "HttpServletRequest.getParameter",
            "HttpServletRequest.getHeader",
            "HttpServletRequest.getQueryString",
            "HttpServletRequest.getPathInfo",
            "javax.servlet.http.Cookie.getValue",
            "java.util.Scanner.nextLine",
            "java.io.BufferedReader.readLine",
            "java.io.Console.readLine",
            "java.net.Socket.getInputStream",
        ],
        label: DataLabel::Source(Cap::USER_INPUT),
    },
    LabelRule {
        matchers: &[
            "java.lang.System.getenv",
            "java.lang.System.getProperty",
            "java.util.Properties.getProperty",
        ],
        label: DataLabel::Source(Cap::ENV_CONFIG),
    },
    // ───────── Sanitizers ──────────
    LabelRule {
        matchers: &[
            "java.lang.Integer.parseInt",
            "java.lang.Long.parseLong",
            "java.util.UUID.fromString",
        ],
        label: DataLabel::Sanitizer(Cap::UNTRUSTED),
    },
    LabelRule {
        matchers: &["org.owasp.esapi.Encoder.encodeForSQL", "encodeForOS"],
        label: DataLabel::Sanitizer(Cap::UNTRUSTED),
    },
    LabelRule {
        matchers: &["org.apache.commons.io.FilenameUtils.getName"],
        label: DataLabel::Sanitizer(Cap::UNTRUSTED),
    },
];
