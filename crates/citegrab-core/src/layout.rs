//! Source-page contracts: every selector and pattern the pipeline depends on.
//!
//! Defaults describe the Google Scholar result page. A redesign of the site
//! only needs changes here (or in the `[layout]` section of the config file).

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::CoreError;
use crate::config_file::LayoutConfig;
use crate::dom::Selector;

static BIBTEX_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)bibtex").unwrap());

#[derive(Debug, Clone)]
pub struct PageLayout {
    /// One visible search result.
    pub result_item: Selector,
    /// Result wrapper carrying the cluster id attribute.
    pub result_container: Selector,
    pub cluster_attr: String,
    /// Per-item element that opens the citation pop-over.
    pub trigger: Selector,
    /// Dismiss control inside the pop-over.
    pub close_control: Selector,
    /// Pop-over elements, hidden while a flow runs and removed as a fallback dismissal.
    pub popup_roots: Vec<Selector>,
    /// Visible label of the citation-file link.
    pub link_label: Regex,
    /// Path suffix of a citation-file URL.
    pub citation_suffix: String,
    pub search_path: String,
    pub suppression_style_id: String,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self::scholar()
    }
}

impl PageLayout {
    pub fn scholar() -> Self {
        Self {
            result_item: Selector::class("gs_ri"),
            result_container: Selector::class("gs_r"),
            cluster_attr: "data-cid".into(),
            trigger: Selector::class("gs_or_cit"),
            close_control: Selector::id("gs_cit-x"),
            popup_roots: vec![
                Selector::id("gs_cit"),
                Selector::id("gs_md_cit-overlay"),
                Selector::class("gs_md_dock_wrapper"),
                Selector::class("gs_citr"),
                Selector::class("gs_ocd_citr"),
            ],
            link_label: BIBTEX_LABEL.clone(),
            citation_suffix: ".bib".into(),
            search_path: "/scholar".into(),
            suppression_style_id: "hidePopup".into(),
        }
    }

    pub fn with_overrides(mut self, overrides: &LayoutConfig) -> Result<Self, CoreError> {
        if let Some(s) = &overrides.result_item {
            self.result_item = Selector::parse(s)?;
        }
        if let Some(s) = &overrides.result_container {
            self.result_container = Selector::parse(s)?;
        }
        if let Some(attr) = &overrides.cluster_attr {
            self.cluster_attr = attr.clone();
        }
        if let Some(s) = &overrides.trigger {
            self.trigger = Selector::parse(s)?;
        }
        if let Some(s) = &overrides.close_control {
            self.close_control = Selector::parse(s)?;
        }
        if let Some(roots) = &overrides.popup_roots {
            self.popup_roots = roots
                .iter()
                .map(|s| Selector::parse(s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(pattern) = &overrides.link_label {
            self.link_label = Regex::new(pattern)?;
        }
        Ok(self)
    }

    /// Whether a resolved URL points at a citation file.
    pub fn is_citation_url(&self, url: &Url) -> bool {
        url.path().ends_with(&self.citation_suffix)
    }

    pub fn is_citation_label(&self, label: &str) -> bool {
        self.link_label.is_match(label)
    }

    /// Stylesheet hiding the pop-over while a flow drives it.
    pub fn suppression_css(&self) -> String {
        let selectors: Vec<String> = self.popup_roots.iter().map(|s| s.to_string()).collect();
        format!("{} {{ display: none !important; }}", selectors.join(","))
    }

    /// Results page URL for a free-text query.
    pub fn search_url(&self, base: &Url, query: &str) -> Result<Url, url::ParseError> {
        let mut url = base.join(&self.search_path)?;
        url.query_pairs_mut().append_pair("q", query);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_url_rule() {
        let layout = PageLayout::scholar();
        let yes = Url::parse("https://scholar.googleusercontent.com/scholar.bib?q=info:x").unwrap();
        let no = Url::parse("https://scholar.google.com/scholar.enw?q=info:x").unwrap();
        let sneaky = Url::parse("https://example.org/file?name=x.bib").unwrap();
        assert!(layout.is_citation_url(&yes));
        assert!(!layout.is_citation_url(&no));
        assert!(!layout.is_citation_url(&sneaky));
    }

    #[test]
    fn label_is_case_insensitive() {
        let layout = PageLayout::scholar();
        assert!(layout.is_citation_label("BibTeX"));
        assert!(layout.is_citation_label("import into bibtex"));
        assert!(!layout.is_citation_label("EndNote"));
    }

    #[test]
    fn search_url_encodes_query() {
        let layout = PageLayout::scholar();
        let base = Url::parse("https://scholar.google.com").unwrap();
        let url = layout.search_url(&base, "attention is all you need").unwrap();
        assert_eq!(
            url.as_str(),
            "https://scholar.google.com/scholar?q=attention+is+all+you+need"
        );
    }

    #[test]
    fn suppression_css_lists_popup_roots() {
        let css = PageLayout::scholar().suppression_css();
        assert!(css.starts_with("#gs_cit,#gs_md_cit-overlay,.gs_md_dock_wrapper"));
        assert!(css.contains("display: none !important"));
    }

    #[test]
    fn overrides_are_validated() {
        let bad = LayoutConfig {
            trigger: Some("div a".into()),
            ..LayoutConfig::default()
        };
        assert!(PageLayout::scholar().with_overrides(&bad).is_err());

        let bad_pattern = LayoutConfig {
            link_label: Some("(".into()),
            ..LayoutConfig::default()
        };
        assert!(matches!(
            PageLayout::scholar().with_overrides(&bad_pattern),
            Err(CoreError::InvalidPattern(_))
        ));
    }
}
