use execflow_core::config::{AppConfig, DuplicateEdgePolicy, RootSelection, KEY_ENV_VAR};
use execflow_crypto::{SharedKey, KEY_LEN};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        check_key(config),
        check_url("Stream URL", &config.agent.stream_url, &["ws", "wss"]),
        check_url("Exec URL", &config.agent.exec_url, &["http", "https"]),
        check_timeouts(config),
        check_compiler(config),
        check_session(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_key(config: &AppConfig) -> CheckResult {
    let Some(encoded) = config.crypto.resolve_key() else {
        return CheckResult {
            label: "Key".into(),
            ok: false,
            detail: format!("Not configured (set [crypto] key or {})", KEY_ENV_VAR),
        };
    };

    match SharedKey::from_base64(&encoded) {
        Ok(_) => CheckResult {
            label: "Key".into(),
            ok: true,
            detail: format!(
                "{}-bit AES-GCM key, associated data {} bytes",
                KEY_LEN * 8,
                config.crypto.associated_data.len()
            ),
        },
        Err(e) => CheckResult {
            label: "Key".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_url(label: &str, raw: &str, schemes: &[&str]) -> CheckResult {
    match reqwest::Url::parse(raw) {
        Ok(url) if schemes.contains(&url.scheme()) => CheckResult {
            label: label.into(),
            ok: true,
            detail: raw.to_string(),
        },
        Ok(url) => CheckResult {
            label: label.into(),
            ok: false,
            detail: format!(
                "{} (scheme '{}', expected {})",
                raw,
                url.scheme(),
                schemes.join(" or ")
            ),
        },
        Err(e) => CheckResult {
            label: label.into(),
            ok: false,
            detail: format!("{} ({})", raw, e),
        },
    }
}

fn check_timeouts(config: &AppConfig) -> CheckResult {
    let agent = &config.agent;
    let connect = match agent.connect_timeout_secs {
        Some(secs) => format!("{}s", secs),
        None => "unbounded".to_string(),
    };
    let ok = agent.request_timeout_secs > 0 && agent.connect_timeout_secs != Some(0);
    CheckResult {
        label: "Timeouts".into(),
        ok,
        detail: format!(
            "request {}s, connect {}",
            agent.request_timeout_secs, connect
        ),
    }
}

fn check_compiler(config: &AppConfig) -> CheckResult {
    let c = &config.compiler;
    let duplicates = match c.duplicate_edges {
        DuplicateEdgePolicy::Collapse => "collapse",
        DuplicateEdgePolicy::Reject => "reject",
    };
    let roots = match c.root_selection {
        RootSelection::Sources => "sources",
        RootSelection::All => "all",
    };
    CheckResult {
        label: "Compiler".into(),
        ok: c.max_depth > 0,
        detail: format!(
            "duplicate edges: {}, roots: {}, max depth {}, empty graphs {}",
            duplicates,
            roots,
            c.max_depth,
            if c.allow_empty { "allowed" } else { "rejected" }
        ),
    }
}

fn check_session(config: &AppConfig) -> CheckResult {
    let capacity = config.session.event_capacity;
    CheckResult {
        label: "Session".into(),
        ok: capacity > 0,
        detail: format!("event capacity {}", capacity),
    }
}
