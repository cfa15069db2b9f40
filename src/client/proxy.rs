//! Proxy selection.
//!
//! The transport defaults to the conventional environment variables:
//! `HTTP_PROXY`, `HTTPS_PROXY`, `NO_PROXY` and their lowercase
//! variants. `HTTP_PROXY` is refused when the process looks like a CGI
//! handler (`REQUEST_METHOD` set), where the variable is attacker
//! controlled.

use std::env;
use std::sync::Arc;

use http::Uri;

use crate::error::Error;

/// Decides the proxy (if any) for a target URL.
pub type ProxySelector = Arc<dyn Fn(&Uri) -> crate::Result<Option<Uri>> + Send + Sync>;

/// A selector that always uses `proxy`.
pub fn proxy_url(proxy: Uri) -> ProxySelector {
    Arc::new(move |_| Ok(Some(proxy.clone())))
}

/// A selector reading the process environment once, at call time of
/// this constructor.
pub fn proxy_from_environment() -> ProxySelector {
    let config = EnvProxyConfig::from_environment();
    Arc::new(move |uri| config.proxy_for(uri))
}

#[derive(Debug, Default)]
pub(crate) struct EnvProxyConfig {
    http_proxy: Option<Uri>,
    /// Set when the value came from the uppercase variable only.
    http_proxy_from_upper: bool,
    https_proxy: Option<Uri>,
    no_proxy: NoProxy,
    cgi: bool,
}

impl EnvProxyConfig {
    pub(crate) fn from_environment() -> EnvProxyConfig {
        let (http_proxy, http_from_upper) = env_pair("http_proxy", "HTTP_PROXY");
        let (https_proxy, _) = env_pair("https_proxy", "HTTPS_PROXY");
        let (no_proxy, _) = env_pair("no_proxy", "NO_PROXY");
        EnvProxyConfig {
            http_proxy: http_proxy.as_deref().and_then(parse_proxy_uri),
            http_proxy_from_upper: http_from_upper,
            https_proxy: https_proxy.as_deref().and_then(parse_proxy_uri),
            no_proxy: NoProxy::parse(no_proxy.as_deref().unwrap_or("")),
            cgi: env::var_os("REQUEST_METHOD").is_some(),
        }
    }

    pub(crate) fn proxy_for(&self, uri: &Uri) -> crate::Result<Option<Uri>> {
        let host = match uri.host() {
            Some(host) => host,
            None => return Ok(None),
        };
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        if self.no_proxy.bypass(host, port) {
            return Ok(None);
        }
        match uri.scheme_str() {
            Some("https") => Ok(self.https_proxy.clone()),
            Some("http") => {
                if self.cgi && self.http_proxy_from_upper && self.http_proxy.is_some() {
                    return Err(Error::new_connect(
                        "refusing to use HTTP_PROXY value in CGI environment; use http_proxy",
                    ));
                }
                Ok(self.http_proxy.clone())
            }
            _ => Ok(None),
        }
    }
}

fn env_pair(lower: &str, upper: &str) -> (Option<String>, bool) {
    match env::var(lower) {
        Ok(v) if !v.is_empty() => (Some(v), false),
        _ => match env::var(upper) {
            Ok(v) if !v.is_empty() => (Some(v), true),
            _ => (None, false),
        },
    }
}

fn parse_proxy_uri(raw: &str) -> Option<Uri> {
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{}", raw)
    };
    with_scheme.parse::<Uri>().ok()
}

/// `NO_PROXY` entries: `*` matches everything; a leading dot (or any
/// bare domain) matches the domain and its subdomains; entries may pin
/// a port.
#[derive(Debug, Default)]
struct NoProxy {
    all: bool,
    entries: Vec<NoProxyEntry>,
}

#[derive(Debug)]
struct NoProxyEntry {
    host: String,
    port: Option<u16>,
}

impl NoProxy {
    fn parse(raw: &str) -> NoProxy {
        let mut no_proxy = NoProxy::default();
        for item in raw.split(',') {
            let item = item.trim().to_ascii_lowercase();
            if item.is_empty() {
                continue;
            }
            if item == "*" {
                no_proxy.all = true;
                continue;
            }
            let (host, port) = match item.rsplit_once(':') {
                Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => {
                    (host.to_owned(), port.parse::<u16>().ok())
                }
                _ => (item, None),
            };
            let host = host.trim_start_matches('.').to_owned();
            if !host.is_empty() {
                no_proxy.entries.push(NoProxyEntry { host, port });
            }
        }
        no_proxy
    }

    fn bypass(&self, host: &str, port: u16) -> bool {
        if self.all {
            return true;
        }
        let host = host.to_ascii_lowercase();
        for entry in &self.entries {
            if let Some(want) = entry.port {
                if want != port {
                    continue;
                }
            }
            if host == entry.host {
                return true;
            }
            if host.ends_with(&entry.host)
                && host.as_bytes()[host.len() - entry.host.len() - 1] == b'.'
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        http: Option<&str>,
        https: Option<&str>,
        no_proxy: &str,
        cgi: bool,
        from_upper: bool,
    ) -> EnvProxyConfig {
        EnvProxyConfig {
            http_proxy: http.and_then(parse_proxy_uri),
            http_proxy_from_upper: from_upper,
            https_proxy: https.and_then(parse_proxy_uri),
            no_proxy: NoProxy::parse(no_proxy),
            cgi,
        }
    }

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn scheme_selects_variable() {
        let cfg = config(
            Some("proxy.local:3128"),
            Some("https://secure.local:3129"),
            "",
            false,
            false,
        );
        assert_eq!(
            cfg.proxy_for(&uri("http://example.com/")).unwrap().unwrap(),
            uri("http://proxy.local:3128")
        );
        assert_eq!(
            cfg.proxy_for(&uri("https://example.com/")).unwrap().unwrap(),
            uri("https://secure.local:3129")
        );
    }

    #[test]
    fn no_proxy_matching() {
        let cfg = config(
            Some("proxy.local"),
            None,
            "example.com, .internal, host.only:9999",
            false,
            false,
        );
        // exact and subdomain matches
        assert!(cfg.proxy_for(&uri("http://example.com/")).unwrap().is_none());
        assert!(cfg
            .proxy_for(&uri("http://sub.example.com/"))
            .unwrap()
            .is_none());
        assert!(cfg.proxy_for(&uri("http://a.internal/")).unwrap().is_none());
        // non-matching host still proxies
        assert!(cfg.proxy_for(&uri("http://example.org/")).unwrap().is_some());
        // port-pinned entry
        assert!(cfg
            .proxy_for(&uri("http://host.only:9999/"))
            .unwrap()
            .is_none());
        assert!(cfg
            .proxy_for(&uri("http://host.only:1234/"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn no_proxy_wildcard() {
        let cfg = config(Some("proxy.local"), None, "*", false, false);
        assert!(cfg.proxy_for(&uri("http://anything.at.all/")).unwrap().is_none());
    }

    #[test]
    fn cgi_refuses_uppercase_http_proxy() {
        let cfg = config(Some("proxy.local"), None, "", true, true);
        assert!(cfg.proxy_for(&uri("http://example.com/")).is_err());
        // lowercase-sourced value is fine even in CGI
        let cfg = config(Some("proxy.local"), None, "", true, false);
        assert!(cfg.proxy_for(&uri("http://example.com/")).unwrap().is_some());
        // https is unaffected
        let cfg = config(None, Some("proxy.local"), "", true, true);
        assert!(cfg.proxy_for(&uri("https://example.com/")).unwrap().is_some());
    }
}
