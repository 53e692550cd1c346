//! Neutral redirect resources
//!
//! `$redirect=` targets resolve to a bundled copy shipped under
//! `/redirects/` and to an equivalent data URL for hosts that cannot serve
//! extension files.

use crate::types::Redirect;

struct Resource {
    name: &'static str,
    aliases: &'static [&'static str],
    file: &'static str,
    data_url: &'static str,
}

const RESOURCES: &[Resource] = &[
    Resource {
        name: "noop.js",
        aliases: &["noopjs", "abp-resource:blank-js"],
        file: "noop.js",
        data_url: "data:application/javascript,",
    },
    Resource {
        name: "noop.css",
        aliases: &["noopcss", "abp-resource:blank-css"],
        file: "noop.css",
        data_url: "data:text/css,",
    },
    Resource {
        name: "noop.html",
        aliases: &["noopframe", "abp-resource:blank-html"],
        file: "noop.html",
        data_url: "data:text/html,%3C!DOCTYPE%20html%3E",
    },
    Resource {
        name: "noop.txt",
        aliases: &["nooptext", "empty", "abp-resource:blank-text"],
        file: "noop.txt",
        data_url: "data:text/plain,",
    },
    Resource {
        name: "1x1.gif",
        aliases: &["1x1-transparent.gif", "abp-resource:1x1-transparent-gif"],
        file: "1x1.gif",
        data_url: "data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7",
    },
];

/// Directory of the bundled copies, relative to the extension root.
pub const REDIRECTS_DIR: &str = "/redirects/";

/// Resolve a redirect resource by name or alias.
pub fn lookup(name: &str) -> Option<Redirect> {
    let name = name.trim();
    // uBO allows a `:priority` suffix on redirect names
    let name = name.split_once(':').map_or(name, |(base, rest)| {
        if rest.chars().all(|c| c.is_ascii_digit() || c == '-') {
            base
        } else {
            name
        }
    });

    RESOURCES
        .iter()
        .find(|r| {
            r.name.eq_ignore_ascii_case(name)
                || r.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
        })
        .map(|r| Redirect {
            resource: r.name.to_string(),
            path: format!("{REDIRECTS_DIR}{}", r.file),
            data_url: r.data_url.to_string(),
        })
}

/// Canonical names of every bundled resource.
pub fn names() -> impl Iterator<Item = &'static str> {
    RESOURCES.iter().map(|r| r.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_aliases() {
        let redirect = lookup("noopjs").unwrap();
        assert_eq!(redirect.resource, "noop.js");
        assert_eq!(redirect.path, "/redirects/noop.js");
        assert!(redirect.data_url.starts_with("data:application/javascript"));

        assert_eq!(lookup("1x1-transparent.gif").unwrap().resource, "1x1.gif");
        assert_eq!(lookup("noop.js:10").unwrap().resource, "noop.js");
        assert_eq!(lookup("abp-resource:blank-css").unwrap().resource, "noop.css");
    }

    #[test]
    fn unknown_resource() {
        assert!(lookup("does-not-exist.js").is_none());
    }
}
