//
// uri.rs
//
// Reference URI normalization and the virtual scheme for remote stylesheets
//

use tower_lsp::lsp_types::Url;

/// Virtual scheme fronting `http://` stylesheets.
pub const HTTP_SCHEME: &str = "css-http";
/// Virtual scheme fronting `https://` stylesheets.
pub const HTTPS_SCHEME: &str = "css-https";

/// Rewrite an `http(s)` URL into its virtual-scheme twin so the editor can
/// open it like any other document. Other schemes return `None`.
pub fn to_virtual(url: &Url) -> Option<Url> {
    let target = match url.scheme() {
        "http" => HTTP_SCHEME,
        "https" => HTTPS_SCHEME,
        _ => return None,
    };
    swap_scheme(url, target)
}

/// Inverse of [`to_virtual`].
pub fn to_remote(url: &Url) -> Option<Url> {
    let target = match url.scheme() {
        HTTP_SCHEME => "http",
        HTTPS_SCHEME => "https",
        _ => return None,
    };
    swap_scheme(url, target)
}

/// Whether a URI is served over the network (read-only for edits).
pub fn is_remote(url: &Url) -> bool {
    matches!(url.scheme(), HTTP_SCHEME | HTTPS_SCHEME | "http" | "https")
}

fn swap_scheme(url: &Url, scheme: &str) -> Option<Url> {
    let rest = &url.as_str()[url.scheme().len()..];
    Url::parse(&format!("{scheme}{rest}")).ok()
}

/// Resolve an href or import specifier found in `base`.
///
/// Absolute `http(s)` targets move to the virtual scheme, relative paths
/// resolve against the directory of `base`, and anything that does not end
/// up as a `file` or virtual-scheme URI (`data:`, `mailto:`, ...) is dropped.
pub fn resolve_reference(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let resolved = if let Some(rest) = href.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        match Url::parse(href) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => base.join(href).ok()?,
            Err(e) => {
                log::trace!("Ignoring unparseable reference '{}' in {}: {}", href, base, e);
                return None;
            }
        }
    };

    match resolved.scheme() {
        "http" | "https" => {
            let mut url = to_virtual(&resolved)?;
            url.set_fragment(None);
            Some(url)
        }
        HTTP_SCHEME | HTTPS_SCHEME => {
            let mut url = resolved;
            url.set_fragment(None);
            Some(url)
        }
        "file" => {
            let mut url = resolved;
            url.set_query(None);
            url.set_fragment(None);
            Some(url)
        }
        other => {
            log::trace!("Ignoring reference with scheme '{}' in {}", other, base);
            None
        }
    }
}
