//! HTML generation via askama template rendering.
//!
//! Two outputs reach the browser: the embed snippet, a single `<script>` tag
//! that loads the viewer and passes it the profile id and display flags as
//! `data-` attributes, and the standalone share page that inlines one
//! profile's JSON for the viewer to render full-page.

use askama::Template;
use miniprof_core::{RESOURCE_PATH, RenderOptions, VERSION};
use miniprof_schemas::Profile;
use uuid::Uuid;

use crate::error::WebError;

/// The viewer script, served under the resource prefix.
pub(crate) const INCLUDES_JS: &str = include_str!("../templates/includes.js");

/// The viewer stylesheet, served under the resource prefix.
pub(crate) const INCLUDES_CSS: &str = include_str!("../templates/includes.css");

/// Askama template for the embed snippet.
///
/// The attribute set is what the viewer script reads on load; renaming one
/// breaks deployed viewers.
#[derive(Template)]
#[template(path = "includes.html")]
struct IncludesTemplate<'a> {
    path: &'a str,
    version: &'a str,
    current_id: String,
    ids: String,
    position: &'a str,
    show_trivial: bool,
    show_children: bool,
    max_traces: usize,
    show_controls: bool,
    authorized: bool,
    toggle_shortcut: &'a str,
    start_hidden: bool,
}

/// Askama template for the share page.
#[derive(Template)]
#[template(path = "share.html")]
struct ShareTemplate<'a> {
    name: &'a str,
    duration: f64,
    path: &'a str,
    version: &'a str,
    json: String,
    includes: String,
}

/// Renders the `<script>` tag that loads the viewer for `profile`.
pub fn render_includes(profile: &Profile, options: &RenderOptions) -> Result<String, WebError> {
    render_includes_for(profile.id, options)
}

/// Renders the viewer `<script>` tag for the profile with `id`.
///
/// Handlers embedding the viewer hold a live [`ProfileHandle`] rather than a
/// finalized profile; the id is all the snippet needs.
///
/// [`ProfileHandle`]: miniprof_core::ProfileHandle
pub fn render_includes_for(id: Uuid, options: &RenderOptions) -> Result<String, WebError> {
    let id = id.to_string();
    let template = IncludesTemplate {
        path: RESOURCE_PATH,
        version: VERSION,
        ids: id.clone(),
        current_id: id,
        position: options.position.as_str(),
        show_trivial: options.show_trivial,
        show_children: options.show_children,
        max_traces: options.max_traces,
        show_controls: options.show_controls,
        authorized: options.authorized,
        toggle_shortcut: &options.toggle_shortcut,
        start_hidden: options.start_hidden,
    };
    let rendered = template.render().map_err(WebError::template)?;
    Ok(rendered.trim_end().to_owned())
}

/// Renders the standalone results page for `profile`.
pub fn render_share(profile: &Profile, options: &RenderOptions) -> Result<String, WebError> {
    let template = ShareTemplate {
        name: &profile.name,
        duration: profile.duration_milliseconds,
        path: RESOURCE_PATH,
        version: VERSION,
        json: script_safe_json(profile)?,
        includes: render_includes(profile, options)?,
    };
    template.render().map_err(WebError::template)
}

/// Encodes `profile` for inlining inside a `<script>` element.
///
/// `</` is escaped so that command text containing `</script>` cannot end
/// the element early; `<\/` reads back as `</` in JavaScript.
fn script_safe_json(profile: &Profile) -> Result<String, WebError> {
    let json = profile.to_json().map_err(WebError::serialize)?;
    Ok(json.replace("</", "<\\/"))
}

#[cfg(test)]
mod tests {
    use miniprof_core::Position;
    use miniprof_schemas::{ExecuteType, SqlTiming, Timing};

    use super::*;

    fn profile() -> Profile {
        let mut root = Timing::new("GET /x");
        root.sql_timings.push(SqlTiming::new(
            ExecuteType::Reader,
            "select '</script><b>'",
            0.0,
            1.0,
        ));
        Profile {
            id: Uuid::new_v4(),
            name: "GET /x".into(),
            root,
            duration_milliseconds: 12.5,
            ..Profile::default()
        }
    }

    #[test]
    fn includes_carries_every_attribute() {
        let p = profile();
        let html = render_includes(&p, &RenderOptions::default()).unwrap();

        assert!(html.starts_with("<script async"));
        assert!(html.ends_with("</script>"));
        assert!(html.contains("src=\"/mini-profiler-resources/includes.js?v=0.2\""));
        for expected in [
            "data-version=\"0.2\"".to_string(),
            "data-path=\"/mini-profiler-resources/\"".to_string(),
            format!("data-current-id=\"{}\"", p.id),
            format!("data-ids=\"{}\"", p.id),
            "data-position=\"left\"".to_string(),
            "data-trivial=\"false\"".to_string(),
            "data-children=\"false\"".to_string(),
            "data-max-traces=\"15\"".to_string(),
            "data-controls=\"true\"".to_string(),
            "data-authorized=\"true\"".to_string(),
            "data-toggle-shortcut=\"Alt+P\"".to_string(),
            "data-start-hidden=\"false\"".to_string(),
        ] {
            assert!(html.contains(&expected), "missing {expected} in {html}");
        }
    }

    #[test]
    fn includes_reflects_options() {
        let options = RenderOptions {
            position: Position::Right,
            show_trivial: true,
            max_traces: 3,
            start_hidden: true,
            ..RenderOptions::default()
        };
        let html = render_includes(&profile(), &options).unwrap();
        assert!(html.contains("data-position=\"right\""));
        assert!(html.contains("data-trivial=\"true\""));
        assert!(html.contains("data-max-traces=\"3\""));
        assert!(html.contains("data-start-hidden=\"true\""));
    }

    #[test]
    fn includes_for_id_matches_profile_rendering() {
        let p = profile();
        let options = RenderOptions::default();
        assert_eq!(
            render_includes_for(p.id, &options).unwrap(),
            render_includes(&p, &options).unwrap()
        );
    }

    #[test]
    fn share_page_inlines_escaped_json() {
        let p = profile();
        let html = render_share(&p, &RenderOptions::default()).unwrap();

        assert!(html.contains("<title>GET /x (12.5 ms) - Profiling Results</title>"));
        assert!(html.contains("var profiler = {"));
        assert!(html.contains(&p.id.to_string()));
        assert!(!html.contains("'</script>"));
        assert!(html.contains("<\\/script>"));
        assert!(html.contains("class=\"profiler-result-full\""));
    }

    #[test]
    fn escaped_json_still_decodes() {
        let p = profile();
        let json = script_safe_json(&p).unwrap();
        let decoded: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, p);
    }
}
