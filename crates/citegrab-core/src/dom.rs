//! In-process document model observed by the extraction pipeline.
//!
//! A [`LiveDocument`] is an arena of element and text nodes behind a mutex,
//! plus a broadcast channel carrying one [`MutationBatch`] per mutating call.
//! Only child-list changes under `body` are broadcast, which is what the link
//! observer subscribes to. Click dispatch runs capture listeners from the root
//! down to the target, then bubble listeners back up, and finally performs the
//! default action (navigation) unless a listener prevented it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use url::Url;

use crate::CoreError;

const CHANGE_CAPACITY: usize = 256;

/// Identity of a node within one [`LiveDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A single child-list change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Added { parent: NodeId, node: NodeId },
    Removed { parent: NodeId, node: NodeId },
}

pub type MutationBatch = Arc<[Mutation]>;

/// Declarative subtree, appended to a document in one mutation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSpec {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<NodeSpec>,
    },
    Text(String),
}

impl NodeSpec {
    pub fn element(tag: impl Into<String>) -> Self {
        NodeSpec::Element {
            tag: tag.into().to_ascii_lowercase(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn text_node(text: impl Into<String>) -> Self {
        NodeSpec::Text(text.into())
    }

    /// Set an attribute. No-op on text nodes.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let NodeSpec::Element { attrs, .. } = &mut self {
            attrs.push((name.into(), value.into()));
        }
        self
    }

    /// Append a text child. No-op on text nodes.
    pub fn text(self, text: impl Into<String>) -> Self {
        self.child(NodeSpec::Text(text.into()))
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        if let NodeSpec::Element { children, .. } = &mut self {
            children.push(child);
        }
        self
    }

    pub fn children(mut self, more: impl IntoIterator<Item = NodeSpec>) -> Self {
        if let NodeSpec::Element { children, .. } = &mut self {
            children.extend(more);
        }
        self
    }
}

/// A compound selector: optional tag, optional `#id`, any number of `.class`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

impl Selector {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_ascii_lowercase()),
            id: None,
            classes: Vec::new(),
        }
    }

    pub fn id(id: &str) -> Self {
        Self {
            tag: None,
            id: Some(id.to_string()),
            classes: Vec::new(),
        }
    }

    pub fn class(class: &str) -> Self {
        Self {
            tag: None,
            id: None,
            classes: vec![class.to_string()],
        }
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let invalid = |message: &str| CoreError::InvalidSelector {
            selector: input.to_string(),
            message: message.to_string(),
        };

        let input_trimmed = input.trim();
        if input_trimmed.is_empty() {
            return Err(invalid("empty selector"));
        }

        let mut selector = Selector {
            tag: None,
            id: None,
            classes: Vec::new(),
        };
        // (kind, name) where kind is None for the tag, Some('#') or Some('.')
        let mut kind: Option<char> = None;
        let mut name = String::new();
        let mut flush = |kind: Option<char>, name: &mut String| -> Result<(), CoreError> {
            if name.is_empty() {
                return match kind {
                    None => Ok(()),
                    Some(_) => Err(invalid("missing name after '#' or '.'")),
                };
            }
            let taken = std::mem::take(name);
            match kind {
                None => selector.tag = Some(taken.to_ascii_lowercase()),
                Some('#') => {
                    if selector.id.is_some() {
                        return Err(invalid("more than one id"));
                    }
                    selector.id = Some(taken);
                }
                _ => selector.classes.push(taken),
            }
            Ok(())
        };

        for ch in input_trimmed.chars() {
            match ch {
                '#' | '.' => {
                    flush(kind, &mut name)?;
                    kind = Some(ch);
                }
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => name.push(c),
                _ => return Err(invalid("only tag, #id and .class parts are supported")),
            }
        }
        flush(kind, &mut name)?;
        Ok(selector)
    }

    fn matches(&self, tag: &str, attrs: &BTreeMap<String, String>) -> bool {
        if let Some(want) = &self.tag {
            if want != tag {
                return false;
            }
        }
        if let Some(want) = &self.id {
            if attrs.get("id") != Some(want) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let Some(class_attr) = attrs.get("class") else {
                return false;
            };
            let have: Vec<&str> = class_attr.split_ascii_whitespace().collect();
            if !self.classes.iter().all(|c| have.contains(&c.as_str())) {
                return false;
            }
        }
        true
    }
}

impl FromStr for Selector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = &self.tag {
            write!(f, "{}", tag)?;
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", id)?;
        }
        for class in &self.classes {
            write!(f, ".{}", class)?;
        }
        Ok(())
    }
}

/// Listener phase, as in DOM event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Capture,
    Bubble,
}

/// A click travelling through the document.
#[derive(Debug)]
pub struct ClickEvent {
    target: NodeId,
    current: NodeId,
    phase: Phase,
    default_prevented: bool,
    propagation_stopped: bool,
}

impl ClickEvent {
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn current_target(&self) -> NodeId {
        self.current
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }
}

pub type Listener = Arc<dyn Fn(&mut ClickEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    node: NodeId,
    phase: Phase,
    callback: Listener,
}

/// What happened after a click finished dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub default_prevented: bool,
    pub navigated_to: Option<Url>,
}

/// An `<a>` element with an `href`, as seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub node: NodeId,
    pub label: String,
    pub href: String,
}

struct DocState {
    nodes: Vec<Node>,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    location: Url,
    navigations: usize,
}

impl DocState {
    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn push(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.0].children.push(id);
        }
        id
    }

    fn build(&mut self, spec: NodeSpec, parent: NodeId) -> NodeId {
        match spec {
            NodeSpec::Text(text) => self.push(NodeKind::Text(text), Some(parent)),
            NodeSpec::Element {
                tag,
                attrs,
                children,
            } => {
                let id = self.push(
                    NodeKind::Element {
                        tag,
                        attrs: attrs.into_iter().collect(),
                    },
                    Some(parent),
                );
                for child in children {
                    self.build(child, id);
                }
                id
            }
        }
    }

    fn is_within(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.node(id).and_then(|n| n.parent);
        }
        false
    }

    fn path_to(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            path.push(id);
            cursor = self.node(id).and_then(|n| n.parent);
        }
        path.reverse();
        path
    }

    fn listeners_on(&self, node: NodeId, phase: Phase) -> Vec<Listener> {
        self.listeners
            .iter()
            .filter(|l| l.node == node && l.phase == phase)
            .map(|l| Arc::clone(&l.callback))
            .collect()
    }

    fn attrs(&self, id: NodeId) -> Option<&BTreeMap<String, String>> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Element { attrs, .. }) => Some(attrs),
            _ => None,
        }
    }

    fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, attrs }) => selector.matches(tag, attrs),
            _ => false,
        }
    }

    fn descendants(&self, scope: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.node(scope) {
            for &child in &node.children {
                out.push(child);
                self.descendants(child, out);
            }
        }
    }

    fn text_of(&self, id: NodeId, out: &mut String) {
        match self.node(id) {
            Some(Node {
                kind: NodeKind::Text(t),
                ..
            }) => out.push_str(t),
            Some(node) => {
                for &child in &node.children {
                    self.text_of(child, out);
                }
            }
            None => {}
        }
    }
}

struct Shared {
    url: Url,
    state: Mutex<DocState>,
    changes: broadcast::Sender<MutationBatch>,
}

/// Shared handle to one live document. Clones refer to the same document.
///
/// Nodes live in an append-only arena and a [`NodeId`] is an index into it.
/// [`remove`](LiveDocument::remove) detaches a subtree but keeps its slots,
/// so ids never dangle and the arena only grows. Documents are short-lived,
/// one per loaded page.
#[derive(Clone)]
pub struct LiveDocument {
    shared: Arc<Shared>,
}

/// Non-owning handle, for listeners stored inside the document itself.
#[derive(Clone)]
pub struct WeakDocument {
    shared: Weak<Shared>,
}

impl WeakDocument {
    pub fn upgrade(&self) -> Option<LiveDocument> {
        self.shared.upgrade().map(|shared| LiveDocument { shared })
    }
}

impl fmt::Debug for LiveDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveDocument")
            .field("url", &self.shared.url.as_str())
            .field("nodes", &self.state().nodes.len())
            .finish()
    }
}

impl LiveDocument {
    /// Create an empty `html > (head, body)` document loaded from `url`.
    pub fn new(url: Url) -> Self {
        let mut state = DocState {
            nodes: Vec::new(),
            root: NodeId(0),
            head: NodeId(0),
            body: NodeId(0),
            listeners: Vec::new(),
            next_listener: 0,
            location: url.clone(),
            navigations: 0,
        };
        let root = state.push(
            NodeKind::Element {
                tag: "html".into(),
                attrs: BTreeMap::new(),
            },
            None,
        );
        state.head = state.push(
            NodeKind::Element {
                tag: "head".into(),
                attrs: BTreeMap::new(),
            },
            Some(root),
        );
        state.body = state.push(
            NodeKind::Element {
                tag: "body".into(),
                attrs: BTreeMap::new(),
            },
            Some(root),
        );
        state.root = root;

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                url,
                state: Mutex::new(state),
                changes,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, DocState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, batch: Vec<Mutation>) {
        if !batch.is_empty() {
            // No receivers is fine: nobody is observing right now.
            let _ = self.shared.changes.send(batch.into());
        }
    }

    pub fn downgrade(&self) -> WeakDocument {
        WeakDocument {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// URL the document was loaded from; the base for resolving links.
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Current location. Changes only when a click's default action navigates.
    pub fn location(&self) -> Url {
        self.state().location.clone()
    }

    pub fn navigation_count(&self) -> usize {
        self.state().navigations
    }

    pub fn root(&self) -> NodeId {
        self.state().root
    }

    pub fn head(&self) -> NodeId {
        self.state().head
    }

    pub fn body(&self) -> NodeId {
        self.state().body
    }

    /// Subscribe to child-list mutation batches under `body`.
    pub fn subscribe(&self) -> broadcast::Receiver<MutationBatch> {
        self.shared.changes.subscribe()
    }

    /// Resolve a possibly relative `href` against the document URL.
    pub fn resolve(&self, href: &str) -> Option<Url> {
        self.shared.url.join(href).ok()
    }

    /// Append a subtree under `parent`, as one mutation batch. Returns the
    /// new subtree's root, or `None` if `parent` is not a node of this
    /// document.
    pub fn append(&self, parent: NodeId, spec: NodeSpec) -> Option<NodeId> {
        self.append_all(parent, vec![spec]).into_iter().next()
    }

    /// Append several subtrees under `parent`, as one mutation batch. Nothing
    /// is added if `parent` is not a node of this document.
    pub fn append_all(&self, parent: NodeId, specs: Vec<NodeSpec>) -> Vec<NodeId> {
        let (added, batch) = {
            let mut state = self.state();
            if state.node(parent).is_none() {
                return Vec::new();
            }
            let observed = state.is_within(parent, state.body);
            let added: Vec<NodeId> = specs
                .into_iter()
                .map(|spec| state.build(spec, parent))
                .collect();
            let batch = if observed {
                added
                    .iter()
                    .map(|&node| Mutation::Added { parent, node })
                    .collect()
            } else {
                Vec::new()
            };
            (added, batch)
        };
        self.emit(batch);
        added
    }

    /// Detach `node` from its parent. The document's fixed roots cannot be removed.
    ///
    /// Detached nodes are never re-inserted, so listeners on the removed
    /// subtree are dropped with it.
    pub fn remove(&self, node: NodeId) -> bool {
        let batch = {
            let mut state = self.state();
            if node == state.root || node == state.head || node == state.body {
                return false;
            }
            let Some(parent) = state.node(node).and_then(|n| n.parent) else {
                return false;
            };
            let observed = state.is_within(parent, state.body);
            state.nodes[parent.0].children.retain(|&c| c != node);
            state.nodes[node.0].parent = None;
            let mut subtree = vec![node];
            state.descendants(node, &mut subtree);
            state.listeners.retain(|l| !subtree.contains(&l.node));
            if observed {
                vec![Mutation::Removed { parent, node }]
            } else {
                Vec::new()
            }
        };
        self.emit(batch);
        true
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        match self.state().node(node).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, .. }) => Some(tag.clone()),
            _ => None,
        }
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<String> {
        self.state().attrs(node).and_then(|a| a.get(name).cloned())
    }

    pub fn set_attr(&self, node: NodeId, name: &str, value: impl Into<String>) {
        let mut state = self.state();
        if let Some(Node {
            kind: NodeKind::Element { attrs, .. },
            ..
        }) = state.nodes.get_mut(node.0)
        {
            attrs.insert(name.to_string(), value.into());
        }
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove_attr(&self, node: NodeId, name: &str) -> Option<String> {
        let mut state = self.state();
        match state.nodes.get_mut(node.0) {
            Some(Node {
                kind: NodeKind::Element { attrs, .. },
                ..
            }) => attrs.remove(name),
            _ => None,
        }
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.state().text_of(node, &mut out);
        out
    }

    /// Whether `node` is still attached to the document tree.
    pub fn is_connected(&self, node: NodeId) -> bool {
        let state = self.state();
        state.node(node).is_some() && state.is_within(node, state.root)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.state().node(node).and_then(|n| n.parent)
    }

    /// All connected elements matching `selector`, in document order.
    pub fn query_all(&self, selector: &Selector) -> Vec<NodeId> {
        let root = self.root();
        self.query_within(root, selector)
    }

    /// Descendants of `scope` matching `selector`, in document order.
    pub fn query_within(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let state = self.state();
        let mut all = Vec::new();
        state.descendants(scope, &mut all);
        all.into_iter()
            .filter(|&id| state.matches(id, selector))
            .collect()
    }

    pub fn query_first(&self, selector: &Selector) -> Option<NodeId> {
        self.query_all(selector).into_iter().next()
    }

    pub fn query_first_within(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.query_within(scope, selector).into_iter().next()
    }

    /// Nearest inclusive ancestor of `node` matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let state = self.state();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if state.matches(id, selector) {
                return Some(id);
            }
            cursor = state.node(id).and_then(|n| n.parent);
        }
        None
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.query_first(&Selector::id(id))
    }

    /// Every connected `<a href>` with its visible text.
    pub fn anchors(&self) -> Vec<Anchor> {
        let state = self.state();
        let mut all = Vec::new();
        state.descendants(state.root, &mut all);
        all.into_iter()
            .filter_map(|id| match state.node(id).map(|n| &n.kind) {
                Some(NodeKind::Element { tag, attrs }) if tag == "a" => {
                    let href = attrs.get("href")?.clone();
                    let mut label = String::new();
                    state.text_of(id, &mut label);
                    Some(Anchor {
                        node: id,
                        label: label.trim().to_string(),
                        href,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Add a `<style id=..>` to `head`, or adopt an existing one with that id.
    ///
    /// The returned guard removes the style when dropped, but only if this call
    /// created it.
    pub fn install_style(&self, id: &str, css: &str) -> StyleGuard {
        if self.find_by_id(id).is_some() {
            return StyleGuard {
                doc: self.clone(),
                node: None,
            };
        }
        let head = self.head();
        let node = self.append(head, NodeSpec::element("style").attr("id", id).text(css));
        StyleGuard {
            doc: self.clone(),
            node,
        }
    }

    pub fn add_listener(&self, node: NodeId, phase: Phase, callback: Listener) -> ListenerId {
        let mut state = self.state();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push(ListenerEntry {
            id,
            node,
            phase,
            callback,
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != id);
        state.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Dispatch a click on `target` and run its default action.
    ///
    /// Listeners are snapshotted before dispatch and run without the document
    /// lock held, so they may freely mutate the document.
    pub fn dispatch_click(&self, target: NodeId) -> DispatchOutcome {
        let plan: Vec<(NodeId, Phase, Listener)> = {
            let state = self.state();
            let path = state.path_to(target);
            let mut plan = Vec::new();
            for &node in &path {
                for callback in state.listeners_on(node, Phase::Capture) {
                    plan.push((node, Phase::Capture, callback));
                }
            }
            for &node in path.iter().rev() {
                for callback in state.listeners_on(node, Phase::Bubble) {
                    plan.push((node, Phase::Bubble, callback));
                }
            }
            plan
        };

        let mut event = ClickEvent {
            target,
            current: target,
            phase: Phase::Capture,
            default_prevented: false,
            propagation_stopped: false,
        };
        let mut stopped_at: Option<NodeId> = None;
        for (node, phase, callback) in plan {
            if let Some(stop) = stopped_at {
                if stop != node {
                    break;
                }
            }
            event.current = node;
            event.phase = phase;
            callback(&mut event);
            if event.propagation_stopped && stopped_at.is_none() {
                stopped_at = Some(node);
            }
        }

        let navigated_to = if event.default_prevented {
            None
        } else {
            self.follow_link(target)
        };
        DispatchOutcome {
            default_prevented: event.default_prevented,
            navigated_to,
        }
    }

    fn follow_link(&self, target: NodeId) -> Option<Url> {
        let mut state = self.state();
        let path = state.path_to(target);
        let href = path.iter().rev().find_map(|&id| match state.node(id) {
            Some(Node {
                kind: NodeKind::Element { tag, attrs },
                ..
            }) if tag == "a" => attrs.get("href").cloned(),
            _ => None,
        })?;
        let destination = self.shared.url.join(&href).ok()?;
        state.location = destination.clone();
        state.navigations += 1;
        Some(destination)
    }
}

/// Removes an installed `<style>` when dropped.
pub struct StyleGuard {
    doc: LiveDocument,
    node: Option<NodeId>,
}

impl StyleGuard {
    pub fn remove(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(node) = self.node.take() {
            if !self.doc.remove(node) {
                tracing::warn!(%node, "suppression style was already detached");
            }
        }
    }
}

impl Drop for StyleGuard {
    fn drop(&mut self) {
        self.release();
    }
}
