//! The ownership marker carried in the Proxmox VM description.
//!
//! Every VM this orchestrator manages has an HTML blob in its notes
//! carrying the catalog identity. A VM without the marker (or whose
//! `name` disagrees with the marker) is foreign and is never mutated or
//! deleted. Older deployments wrote a pipe-delimited form, which still
//! parses.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpsDescription {
    pub vps_id: String,
    pub organization_id: String,
    pub creator_id: String,
    pub display_name: String,
}

const LEGACY_PREFIX: &str = "OCVPS";

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn html_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Render the marker blob for a VM description.
pub fn build_vps_description(desc: &VpsDescription) -> String {
    format!(
        "<div data-vps-id=\"{}\" data-org-id=\"{}\" data-creator-id=\"{}\" data-display-name=\"{}\">Managed by Obiente Cloud - do not edit</div>",
        html_escape(&desc.vps_id),
        html_escape(&desc.organization_id),
        html_escape(&desc.creator_id),
        html_escape(&desc.display_name),
    )
}

fn attr(html: &str, name: &str) -> Option<String> {
    let needle = format!("{}=\"", name);
    let start = html.find(&needle)? + needle.len();
    let end = html[start..].find('"')? + start;
    Some(html_unescape(&html[start..end]))
}

fn parse_html(description: &str) -> Option<VpsDescription> {
    Some(VpsDescription {
        vps_id: attr(description, "data-vps-id")?,
        organization_id: attr(description, "data-org-id")?,
        creator_id: attr(description, "data-creator-id")?,
        display_name: attr(description, "data-display-name").unwrap_or_default(),
    })
}

fn parse_legacy(description: &str) -> Option<VpsDescription> {
    let mut parts = description.trim().split('|');
    if parts.next()? != LEGACY_PREFIX {
        return None;
    }
    Some(VpsDescription {
        vps_id: parts.next()?.to_string(),
        organization_id: parts.next()?.to_string(),
        creator_id: parts.next()?.to_string(),
        display_name: parts.next().unwrap_or_default().to_string(),
    })
}

/// Parse the ownership marker out of a VM description, accepting both
/// the HTML form and the legacy pipe-delimited form. Returns `None`
/// for foreign VMs.
pub fn parse_vps_description(description: &str) -> Option<VpsDescription> {
    parse_html(description).or_else(|| parse_legacy(description))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> VpsDescription {
        VpsDescription {
            vps_id: "vps-a1b2c3".to_string(),
            organization_id: "org-42".to_string(),
            creator_id: "user-7".to_string(),
            display_name: "web server \"prod\" & friends".to_string(),
        }
    }

    #[test]
    fn build_then_parse_round_trips() {
        let d = desc();
        let html = build_vps_description(&d);
        assert_eq!(parse_vps_description(&html), Some(d));
    }

    #[test]
    fn legacy_pipe_form_parses_to_same_values() {
        let parsed =
            parse_vps_description("OCVPS|vps-a1b2c3|org-42|user-7|old web server").unwrap();
        assert_eq!(parsed.vps_id, "vps-a1b2c3");
        assert_eq!(parsed.organization_id, "org-42");
        assert_eq!(parsed.creator_id, "user-7");
        assert_eq!(parsed.display_name, "old web server");
    }

    #[test]
    fn foreign_descriptions_do_not_parse() {
        assert_eq!(parse_vps_description("my own vm, hands off"), None);
        assert_eq!(parse_vps_description(""), None);
        assert_eq!(parse_vps_description("a|b|c|d|e"), None);
    }

    #[test]
    fn display_name_survives_html_escaping() {
        let d = desc();
        let html = build_vps_description(&d);
        assert!(html.contains("&quot;prod&quot;"));
        assert_eq!(
            parse_vps_description(&html).unwrap().display_name,
            d.display_name
        );
    }
}
