//! HTML to [`LiveDocument`] conversion.
//!
//! scraper types are !Send, so callers run these functions inside
//! `spawn_blocking` and move only the resulting document or specs across.

use citegrab_core::{LiveDocument, NodeSpec};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector as CssSelector};
use url::Url;

static BODY: Lazy<CssSelector> = Lazy::new(|| CssSelector::parse("body").unwrap());

/// Elements whose content never matters to the pipeline.
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Parse a full page into a live document loaded from `url`.
pub fn parse_page(html: &str, url: Url) -> LiveDocument {
    let document = Html::parse_document(html);
    let doc = LiveDocument::new(url);
    if let Some(body) = document.select(&BODY).next() {
        doc.append_all(doc.body(), children_specs(body));
    }
    doc
}

/// Parse an HTML fragment into specs ready for [`LiveDocument::append_all`].
pub fn parse_fragment(html: &str) -> Vec<NodeSpec> {
    let fragment = Html::parse_fragment(html);
    children_specs(fragment.root_element())
}

fn children_specs(element: ElementRef<'_>) -> Vec<NodeSpec> {
    let mut specs = Vec::new();
    for child in element.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    if let Some(spec) = element_spec(el) {
                        specs.push(spec);
                    }
                }
            }
            Node::Text(text) => {
                let text: &str = text;
                if !text.trim().is_empty() {
                    specs.push(NodeSpec::text_node(text));
                }
            }
            _ => {}
        }
    }
    specs
}

fn element_spec(element: ElementRef<'_>) -> Option<NodeSpec> {
    let value = element.value();
    let tag = value.name();
    if SKIPPED_TAGS.contains(&tag) {
        return None;
    }
    let spec = value
        .attrs()
        .fold(NodeSpec::element(tag), |spec, (name, val)| spec.attr(name, val));
    Some(spec.children(children_specs(element)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use citegrab_core::Selector;

    const RESULTS: &str = r#"<!doctype html>
<html><head><title>results</title><script>var x = 1;</script></head>
<body>
  <div id="gs_res_ccl_mid">
    <div class="gs_r gs_or gs_scl" data-cid="abc123" data-rp="0">
      <div class="gs_ri">
        <h3 class="gs_rt"><a href="https://example.org/paper">Attention Is All You Need</a></h3>
        <div class="gs_fl"><a href="javascript:void(0)" class="gs_or_cit gs_nph">Cite</a></div>
      </div>
    </div>
    <div class="gs_r gs_or gs_scl" data-cid="def456" data-rp="1">
      <div class="gs_ri"><a class="gs_or_cit">Cite</a></div>
    </div>
  </div>
  <script>document.write("ignored")</script>
</body></html>"#;

    #[test]
    fn page_structure_survives_conversion() {
        let doc = parse_page(
            RESULTS,
            Url::parse("https://scholar.google.com/scholar?q=attention").unwrap(),
        );
        let containers = doc.query_all(&Selector::class("gs_r"));
        assert_eq!(containers.len(), 2);
        assert_eq!(doc.attr(containers[0], "data-cid").as_deref(), Some("abc123"));

        let triggers = doc.query_all(&Selector::class("gs_or_cit"));
        assert_eq!(triggers.len(), 2);
        assert_eq!(
            doc.closest(triggers[1], &Selector::class("gs_r")),
            Some(containers[1])
        );
        assert!(doc.query_first(&Selector::tag("script")).is_none());
    }

    #[test]
    fn anchors_resolve_against_page_url() {
        let doc = parse_page(
            r#"<body><a href="/scholar.bib?q=info:x">BibTeX</a></body>"#,
            Url::parse("https://scholar.google.com/scholar?q=x").unwrap(),
        );
        let anchors = doc.anchors();
        assert_eq!(anchors.len(), 1);
        assert_eq!(
            doc.resolve(&anchors[0].href).map(|u| u.to_string()).as_deref(),
            Some("https://scholar.google.com/scholar.bib?q=info:x")
        );
    }

    #[test]
    fn fragment_keeps_top_level_siblings() {
        let specs = parse_fragment(
            r#"<div id="gs_citt"><table><tr><th>MLA</th></tr></table></div>
               <div id="gs_citi"><a class="gs_citi" href="https://scholar.googleusercontent.com/scholar.bib?q=info:x">BibTeX</a></div>"#,
        );
        assert_eq!(specs.len(), 2);
        assert!(matches!(&specs[1], NodeSpec::Element { tag, .. } if tag == "div"));
    }
}
