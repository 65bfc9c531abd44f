use std::fmt;
use std::sync::Arc;

use tracing::warn;
use winnow::{
    ModalResult, Parser,
    ascii::{digit1, multispace0, multispace1},
    combinator::opt,
    token::take_while,
};

use crate::blocklist::Blocklist;
use crate::pac::evaluator::PacEngine;
use crate::pac::fetcher::PacFetcher;

/// An upstream proxy as named by a PAC script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
    /// True for `HTTPS` PAC entries: the proxy itself is reached over TLS.
    pub tls: bool,
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One entry of the ordered upstream list for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Direct,
    Proxy(ProxyServer),
}

/// Turns a request URL into an ordered list of upstream candidates by
/// running the PAC script, filtering out blocklisted proxies.
pub struct ProxyFinder {
    fetcher: PacFetcher,
    engine: PacEngine,
    blocklist: Arc<Blocklist>,
}

impl ProxyFinder {
    pub fn new(pac_url: Option<String>, blocklist: Arc<Blocklist>) -> Self {
        ProxyFinder {
            fetcher: PacFetcher::new(pac_url),
            engine: PacEngine::new(),
            blocklist,
        }
    }

    #[cfg(test)]
    pub fn with_script(script: &str, blocklist: Arc<Blocklist>) -> Self {
        ProxyFinder {
            fetcher: PacFetcher::preloaded(script),
            engine: PacEngine::new(),
            blocklist,
        }
    }

    /// The candidate list is never empty: with no PAC configured, a failed
    /// fetch, a script error, or every proxy blocklisted, it ends in
    /// `Candidate::Direct`.
    pub async fn find(&self, url: &str) -> Vec<Candidate> {
        let Some(script) = self.fetcher.script().await else {
            return vec![Candidate::Direct];
        };

        let host = match url::Url::parse(url) {
            Ok(parsed) => parsed.host_str().unwrap_or_default().to_string(),
            Err(_) => url.to_string(),
        };

        let result = match self.engine.find_proxy(script, url, &host).await {
            Ok(result) => result,
            Err(err) => {
                warn!("PAC evaluation failed for {url}, falling back to DIRECT: {err}");
                return vec![Candidate::Direct];
            }
        };

        let mut candidates: Vec<Candidate> = parse_proxy_list(&result)
            .into_iter()
            .filter(|candidate| match candidate {
                Candidate::Direct => true,
                Candidate::Proxy(proxy) => !self.blocklist.is_blocked(&proxy.host),
            })
            .collect();
        if candidates.is_empty() {
            candidates.push(Candidate::Direct);
        }
        candidates
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Forces the PAC script to be fetched again on the next request.
    #[allow(dead_code)]
    pub async fn invalidate(&self) {
        self.fetcher.invalidate().await;
    }
}

/// Parses a `FindProxyForURL` result: semicolon-separated tokens, each
/// `DIRECT`, `PROXY host:port`, or `HTTPS host:port`. Unknown token kinds
/// (`SOCKS ...` and friends) are dropped silently, as are malformed
/// endpoints.
pub fn parse_proxy_list(result: &str) -> Vec<Candidate> {
    result
        .split(';')
        .filter_map(|token| {
            let mut input = token;
            proxy_token(&mut input).ok().flatten()
        })
        .collect()
}

fn proxy_token(input: &mut &str) -> ModalResult<Option<Candidate>> {
    let _ = multispace0.parse_next(input)?;
    let kind = take_while(1.., |c: char| c.is_ascii_alphanumeric()).parse_next(input)?;
    let tls = match kind.to_ascii_uppercase().as_str() {
        "DIRECT" => return Ok(Some(Candidate::Direct)),
        "PROXY" => false,
        "HTTPS" => true,
        _ => return Ok(None),
    };
    match opt((multispace1, endpoint)).parse_next(input)? {
        Some((_, (host, port))) => Ok(Some(Candidate::Proxy(ProxyServer { host, port, tls }))),
        None => Ok(None),
    }
}

fn endpoint(input: &mut &str) -> ModalResult<(String, u16)> {
    let host =
        take_while(1.., |c: char| c != ':' && c != ';' && !c.is_whitespace()).parse_next(input)?;
    let _ = ':'.parse_next(input)?;
    let port = digit1.try_map(str::parse::<u16>).parse_next(input)?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(host: &str, port: u16) -> Candidate {
        Candidate::Proxy(ProxyServer {
            host: host.to_string(),
            port,
            tls: false,
        })
    }

    #[test]
    fn test_parse_direct() {
        assert_eq!(parse_proxy_list("DIRECT"), vec![Candidate::Direct]);
    }

    #[test]
    fn test_parse_proxy_then_direct() {
        assert_eq!(
            parse_proxy_list("PROXY proxy.example.com:3128; DIRECT"),
            vec![proxy("proxy.example.com", 3128), Candidate::Direct]
        );
    }

    #[test]
    fn test_parse_https_token_marks_tls() {
        assert_eq!(
            parse_proxy_list("HTTPS secure.example.com:443"),
            vec![Candidate::Proxy(ProxyServer {
                host: "secure.example.com".to_string(),
                port: 443,
                tls: true,
            })]
        );
    }

    #[test]
    fn test_unknown_tokens_are_dropped() {
        assert_eq!(
            parse_proxy_list("SOCKS socks.example.com:1080; PROXY p.example.com:8080; SOCKS5 s:1"),
            vec![proxy("p.example.com", 8080)]
        );
    }

    #[test]
    fn test_malformed_endpoints_are_dropped() {
        assert_eq!(parse_proxy_list("PROXY"), vec![]);
        assert_eq!(parse_proxy_list("PROXY noport"), vec![]);
        assert_eq!(parse_proxy_list("PROXY host:notaport; DIRECT"), vec![Candidate::Direct]);
    }

    #[test]
    fn test_trailing_separator_and_spacing() {
        assert_eq!(
            parse_proxy_list("  PROXY a.example.com:1 ;  PROXY b.example.com:2; "),
            vec![proxy("a.example.com", 1), proxy("b.example.com", 2)]
        );
        assert_eq!(parse_proxy_list(""), vec![]);
    }

    #[tokio::test]
    async fn test_find_filters_blocklisted_proxies() {
        let blocklist = Arc::new(Blocklist::new());
        let finder = ProxyFinder::with_script(
            r#"function FindProxyForURL(url, host) {
                return "PROXY dead.example.com:8080; PROXY alive.example.com:8080";
            }"#,
            blocklist.clone(),
        );
        blocklist.block("dead.example.com");
        assert_eq!(
            finder.find("http://www.example.com/").await,
            vec![proxy("alive.example.com", 8080)]
        );
    }

    #[tokio::test]
    async fn test_find_falls_back_to_direct_when_all_blocked() {
        let blocklist = Arc::new(Blocklist::new());
        let finder = ProxyFinder::with_script(
            r#"function FindProxyForURL(url, host) { return "PROXY only.example.com:8080"; }"#,
            blocklist.clone(),
        );
        blocklist.block("only.example.com");
        assert_eq!(
            finder.find("http://www.example.com/").await,
            vec![Candidate::Direct]
        );
    }

    #[tokio::test]
    async fn test_find_without_pac_is_direct() {
        let finder = ProxyFinder::new(None, Arc::new(Blocklist::new()));
        assert_eq!(
            finder.find("http://www.example.com/").await,
            vec![Candidate::Direct]
        );
    }

    #[tokio::test]
    async fn test_find_with_broken_script_is_direct() {
        let finder = ProxyFinder::with_script(
            "function FindProxyForURL(url, host) { return 12; }",
            Arc::new(Blocklist::new()),
        );
        assert_eq!(
            finder.find("http://www.example.com/").await,
            vec![Candidate::Direct]
        );
    }
}
