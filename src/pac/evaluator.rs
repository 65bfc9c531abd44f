use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use boa_engine::{Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source};
use chrono::{Datelike, Local, Timelike, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Upper bound on a single `FindProxyForURL` run, to defend against
/// pathological scripts.
const EVAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("PAC script failed: {0}")]
    Script(String),
    #[error("PAC engine setup failed: {0}")]
    Engine(String),
    #[error("FindProxyForURL did not return a string")]
    NonString,
    #[error("PAC evaluation timed out")]
    Timeout,
    #[error("PAC evaluation task failed: {0}")]
    Task(String),
}

/// Runs PAC scripts in a sandboxed JavaScript context.
///
/// The embedded engine is not reentrant, so evaluations are serialized by a
/// mutex and executed on a blocking thread. The script body is cached by the
/// fetcher; each evaluation builds a fresh context around it.
pub struct PacEngine {
    eval_lock: AsyncMutex<()>,
}

impl PacEngine {
    pub fn new() -> Self {
        PacEngine {
            eval_lock: AsyncMutex::new(()),
        }
    }

    /// Evaluates `FindProxyForURL(url, host)` and returns the raw result
    /// string (e.g. `"PROXY proxy.corp:8080; DIRECT"`).
    pub async fn find_proxy(
        &self,
        script: Arc<str>,
        url: &str,
        host: &str,
    ) -> Result<String, ScriptError> {
        let _serialized = self.eval_lock.lock().await;
        let url = url.to_string();
        let host = host.to_string();
        let task = tokio::task::spawn_blocking(move || evaluate(&script, &url, &host));
        match tokio::time::timeout(EVAL_TIMEOUT, task).await {
            Err(_) => Err(ScriptError::Timeout),
            Ok(Err(join)) => Err(ScriptError::Task(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn evaluate(script: &str, url: &str, host: &str) -> Result<String, ScriptError> {
    let mut context = Context::default();
    register_helpers(&mut context).map_err(|e| ScriptError::Engine(e.to_string()))?;

    context
        .eval(Source::from_bytes(script.as_bytes()))
        .map_err(|e| ScriptError::Script(e.to_string()))?;

    let call = format!(
        "FindProxyForURL(\"{}\", \"{}\")",
        escape_js(url),
        escape_js(host)
    );
    let value = context
        .eval(Source::from_bytes(call.as_bytes()))
        .map_err(|e| ScriptError::Script(e.to_string()))?;

    match value.as_string() {
        Some(s) => Ok(s.to_std_string_escaped()),
        None => Err(ScriptError::NonString),
    }
}

fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn register_helpers(context: &mut Context) -> JsResult<()> {
    let helpers: &[(&str, usize, fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>)] = &[
        ("isPlainHostName", 1, is_plain_host_name),
        ("dnsDomainIs", 2, dns_domain_is),
        ("localHostOrDomainIs", 2, local_host_or_domain_is),
        ("isResolvable", 1, is_resolvable),
        ("isInNet", 3, is_in_net),
        ("dnsResolve", 1, dns_resolve),
        ("myIpAddress", 0, my_ip_address),
        ("dnsDomainLevels", 1, dns_domain_levels),
        ("shExpMatch", 2, sh_exp_match),
        ("weekdayRange", 3, weekday_range),
        ("dateRange", 6, date_range),
        ("timeRange", 6, time_range),
        ("alert", 1, alert),
    ];
    for (name, arity, body) in helpers {
        context.register_global_builtin_callable(
            JsString::from(*name),
            *arity,
            NativeFunction::from_fn_ptr(*body),
        )?;
    }
    Ok(())
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn is_plain_host_name(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::Boolean(!host.contains('.')))
}

fn dns_domain_is(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?.to_ascii_lowercase();
    let domain = string_arg(args, 1, context)?.to_ascii_lowercase();
    Ok(JsValue::Boolean(host.ends_with(&domain)))
}

fn local_host_or_domain_is(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?.to_ascii_lowercase();
    let hostdom = string_arg(args, 1, context)?.to_ascii_lowercase();
    Ok(JsValue::Boolean(
        host == hostdom || hostdom.starts_with(&format!("{host}.")),
    ))
}

fn is_resolvable(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::Boolean(resolve_ipv4(&host).is_some()))
}

fn is_in_net(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    let mask = string_arg(args, 2, context)?;

    let matched = (|| -> Option<bool> {
        let host_ip = resolve_ipv4(&host)?;
        let pattern: Ipv4Addr = pattern.parse().ok()?;
        let mask: Ipv4Addr = mask.parse().ok()?;
        Some(u32::from(host_ip) & u32::from(mask) == u32::from(pattern) & u32::from(mask))
    })();

    Ok(JsValue::Boolean(matched.unwrap_or(false)))
}

fn dns_resolve(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let resolved = resolve_ipv4(&host)
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    Ok(JsValue::String(JsString::from(resolved)))
}

fn my_ip_address(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    let ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
    Ok(JsValue::String(JsString::from(ip.to_string())))
}

fn dns_domain_levels(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let levels = host.chars().filter(|&c| c == '.').count();
    Ok(JsValue::Integer(levels as i32))
}

fn sh_exp_match(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    Ok(JsValue::Boolean(glob_match(&value, &pattern)))
}

fn alert(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let message = string_arg(args, 0, context)?;
    debug!("PAC alert: {message}");
    Ok(JsValue::undefined())
}

// -- Netscape date/time helpers ------------------------------------------

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

enum HelperArg {
    Num(i32),
    Text(String),
}

/// Collects the call arguments, peeling a trailing "GMT" flag off the end.
fn collect_range_args(
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<(Vec<HelperArg>, bool)> {
    let mut collected = Vec::with_capacity(args.len());
    for value in args {
        if value.is_undefined() {
            break;
        }
        if let Some(n) = value.as_number() {
            collected.push(HelperArg::Num(n as i32));
        } else {
            collected.push(HelperArg::Text(
                value.to_string(context)?.to_std_string_escaped(),
            ));
        }
    }
    let gmt = matches!(collected.last(), Some(HelperArg::Text(s)) if s.eq_ignore_ascii_case("GMT"));
    if gmt {
        collected.pop();
    }
    Ok((collected, gmt))
}

fn weekday_range(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (args, gmt) = collect_range_args(args, context)?;
    let today = if gmt {
        Utc::now().weekday().num_days_from_sunday() as usize
    } else {
        Local::now().weekday().num_days_from_sunday() as usize
    };
    let days: Option<Vec<usize>> = args
        .iter()
        .map(|a| match a {
            HelperArg::Text(s) => WEEKDAYS.iter().position(|w| s.eq_ignore_ascii_case(w)),
            HelperArg::Num(_) => None,
        })
        .collect();
    let matched = match days.as_deref() {
        Some([day]) => *day == today,
        Some([from, to]) => wrapping_range_contains(*from, *to, today),
        _ => false,
    };
    Ok(JsValue::Boolean(matched))
}

fn time_range(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (args, gmt) = collect_range_args(args, context)?;
    let now = if gmt {
        Utc::now().num_seconds_from_midnight()
    } else {
        Local::now().num_seconds_from_midnight()
    };
    let nums: Option<Vec<u32>> = args
        .iter()
        .map(|a| match a {
            HelperArg::Num(n) if *n >= 0 => Some(*n as u32),
            _ => None,
        })
        .collect();
    let matched = match nums.as_deref() {
        Some([hour]) => now / 3600 == *hour,
        Some([h1, h2]) => seconds_in_range(h1 * 3600, h2 * 3600 + 3599, now),
        Some([h1, m1, h2, m2]) => {
            seconds_in_range(h1 * 3600 + m1 * 60, h2 * 3600 + m2 * 60 + 59, now)
        }
        Some([h1, m1, s1, h2, m2, s2]) => {
            seconds_in_range(h1 * 3600 + m1 * 60 + s1, h2 * 3600 + m2 * 60 + s2, now)
        }
        _ => false,
    };
    Ok(JsValue::Boolean(matched))
}

fn date_range(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (args, gmt) = collect_range_args(args, context)?;
    let (year, month, day) = if gmt {
        let now = Utc::now();
        (now.year(), now.month0() as usize, now.day())
    } else {
        let now = Local::now();
        (now.year(), now.month0() as usize, now.day())
    };

    // Classify each argument: 1-31 is a day, a month name is a month,
    // anything else numeric is a year.
    #[derive(Clone, Copy, PartialEq)]
    enum DatePart {
        Day(u32),
        Month(usize),
        Year(i32),
    }
    let parts: Option<Vec<DatePart>> = args
        .iter()
        .map(|a| match a {
            HelperArg::Num(n) if (1..=31).contains(n) => Some(DatePart::Day(*n as u32)),
            HelperArg::Num(n) if *n > 31 => Some(DatePart::Year(*n)),
            HelperArg::Text(s) => MONTHS
                .iter()
                .position(|m| s.eq_ignore_ascii_case(m))
                .map(DatePart::Month),
            _ => None,
        })
        .collect();
    let Some(parts) = parts else {
        return Ok(JsValue::Boolean(false));
    };

    let matched = match parts.as_slice() {
        [DatePart::Day(d)] => *d == day,
        [DatePart::Month(m)] => *m == month,
        [DatePart::Year(y)] => *y == year,
        [DatePart::Day(d1), DatePart::Day(d2)] => (*d1..=*d2).contains(&day),
        [DatePart::Month(m1), DatePart::Month(m2)] => wrapping_range_contains(*m1, *m2, month),
        [DatePart::Year(y1), DatePart::Year(y2)] => (*y1..=*y2).contains(&year),
        [DatePart::Day(d1), DatePart::Month(m1), DatePart::Day(d2), DatePart::Month(m2)] => {
            ordered_in_range((*m1, *d1), (*m2, *d2), (month, day))
        }
        [DatePart::Month(m1), DatePart::Year(y1), DatePart::Month(m2), DatePart::Year(y2)] => {
            ordered_in_range((*y1, *m1 as u32), (*y2, *m2 as u32), (year, month as u32))
        }
        [DatePart::Day(d1), DatePart::Month(m1), DatePart::Year(y1), DatePart::Day(d2), DatePart::Month(m2), DatePart::Year(y2)] => {
            ordered_in_range((*y1, *m1, *d1), (*y2, *m2, *d2), (year, month, day))
        }
        _ => false,
    };
    Ok(JsValue::Boolean(matched))
}

fn wrapping_range_contains(from: usize, to: usize, value: usize) -> bool {
    if from <= to {
        (from..=to).contains(&value)
    } else {
        value >= from || value <= to
    }
}

fn seconds_in_range(start: u32, end: u32, now: u32) -> bool {
    if start <= end {
        (start..=end).contains(&now)
    } else {
        now >= start || now <= end
    }
}

fn ordered_in_range<T: PartialOrd>(from: T, to: T, value: T) -> bool {
    from <= value && value <= to
}

// -- Support ---------------------------------------------------------------

/// Glob matching per shExpMatch: `*` and `?` wildcards, everything else
/// literal. Compiled patterns are cached; a pattern that fails to compile
/// never matches.
fn glob_match(value: &str, pattern: &str) -> bool {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    let compiled = cache
        .entry(pattern.to_string())
        .or_insert_with(|| Regex::new(&glob_to_regex(pattern)).ok());
    match compiled {
        Some(re) => re.is_match(value),
        None => false,
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                out.push('\\');
                out.push(c);
            }
        }
    }
    out.push('$');
    out
}

/// Blocking DNS lookup returning the first A record.
fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

/// Single local IPv4 address, taken from the default route. No packets are
/// sent by connecting a UDP socket.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_plain_script() {
        let script = r#"
            function FindProxyForURL(url, host) {
                if (isPlainHostName(host) || dnsDomainIs(host, ".internal.example.com")) {
                    return "DIRECT";
                }
                if (shExpMatch(url, "http://*.blocked.example.com/*")) {
                    return "PROXY filter.example.com:8080";
                }
                return "PROXY proxy.example.com:3128; DIRECT";
            }
        "#;
        assert_eq!(
            evaluate(script, "http://intranet", "intranet").unwrap(),
            "DIRECT"
        );
        assert_eq!(
            evaluate(script, "http://www.internal.example.com/", "www.internal.example.com")
                .unwrap(),
            "DIRECT"
        );
        assert_eq!(
            evaluate(script, "http://x.blocked.example.com/page", "x.blocked.example.com")
                .unwrap(),
            "PROXY filter.example.com:8080"
        );
        assert_eq!(
            evaluate(script, "http://www.example.org/", "www.example.org").unwrap(),
            "PROXY proxy.example.com:3128; DIRECT"
        );
    }

    #[test]
    fn test_evaluate_throwing_script_is_an_error() {
        let script = "function FindProxyForURL(url, host) { throw new Error('nope'); }";
        assert!(matches!(
            evaluate(script, "http://a/", "a"),
            Err(ScriptError::Script(_))
        ));
    }

    #[test]
    fn test_evaluate_non_string_result_is_an_error() {
        let script = "function FindProxyForURL(url, host) { return 42; }";
        assert!(matches!(
            evaluate(script, "http://a/", "a"),
            Err(ScriptError::NonString)
        ));
    }

    #[test]
    fn test_evaluate_escapes_arguments() {
        let script = "function FindProxyForURL(url, host) { return url; }";
        assert_eq!(
            evaluate(script, "http://a/\"quoted\"", "a").unwrap(),
            "http://a/\"quoted\""
        );
    }

    #[test]
    fn test_is_in_net_literal() {
        let script = r#"
            function FindProxyForURL(url, host) {
                return isInNet(host, "10.1.0.0", "255.255.0.0") ? "DIRECT" : "PROXY p:1";
            }
        "#;
        assert_eq!(evaluate(script, "http://10.1.2.3/", "10.1.2.3").unwrap(), "DIRECT");
        assert_eq!(
            evaluate(script, "http://10.2.2.3/", "10.2.2.3").unwrap(),
            "PROXY p:1"
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("http://www.example.com/", "http://*.example.com/*"));
        assert!(glob_match("hosta", "host?"));
        assert!(!glob_match("host.example", "host?"));
        assert!(glob_match("a+b", "a+b"));
    }

    #[test]
    fn test_wrapping_ranges() {
        assert!(wrapping_range_contains(1, 5, 3));
        assert!(!wrapping_range_contains(1, 5, 6));
        // FRI..MON wraps over the weekend
        assert!(wrapping_range_contains(5, 1, 0));
        assert!(wrapping_range_contains(5, 1, 6));
        assert!(!wrapping_range_contains(5, 1, 3));
    }

    #[test]
    fn test_seconds_in_range_wraps_midnight() {
        assert!(seconds_in_range(22 * 3600, 6 * 3600, 23 * 3600));
        assert!(seconds_in_range(22 * 3600, 6 * 3600, 3600));
        assert!(!seconds_in_range(22 * 3600, 6 * 3600, 12 * 3600));
    }
}
