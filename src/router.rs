//! Radix-tree request router.
//!
//! One tree for every method: each vertex carries a handler slot per
//! [`Method`]. Registration splits vertices on the longest common prefix;
//! lookup walks the tree preferring static children, then the parameter
//! child, then the catch-all child, and backtracks when a branch dead-ends.
//!
//! Pattern grammar:
//!
//! ```text
//! /users            static
//! /users/:id        parameter, matches up to the next '/'
//! /static/*         catch-all, must be last; its name is "*"
//! ```
//!
//! Parameter values are written into a caller-owned buffer whose length is
//! [`Router::max_param`]; the router itself never allocates on lookup.

use std::sync::Arc;

use crate::method::Method;

const ROOT: usize = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum Kind {
    Static,
    Param,
    Any,
}

struct Node<H> {
    kind: Kind,
    label: u8,
    prefix: String,
    parent: Option<usize>,
    /// Ordered by kind: static children first, then the param child, then the any child.
    children: Vec<usize>,
    handlers: [Option<H>; Method::COUNT],
    ppath: Arc<str>,
    pnames: Arc<[String]>,
}

impl<H> Node<H> {
    fn new(kind: Kind, prefix: &str, parent: Option<usize>) -> Self {
        Self {
            kind,
            label: prefix.as_bytes().first().copied().unwrap_or(0),
            prefix: prefix.to_owned(),
            parent,
            children: Vec::new(),
            handlers: std::array::from_fn(|_| None),
            ppath: Arc::from(""),
            pnames: Arc::from(Vec::new()),
        }
    }

    fn has_handlers(&self) -> bool {
        self.handlers.iter().any(Option::is_some)
    }
}

/// Result of a lookup.
pub enum Lookup<'r, H> {
    /// A handler is registered for the method at the matched route.
    Matched(&'r H),
    /// The path matched a route registered for other methods only.
    MethodNotAllowed,
    NotFound,
}

/// A lookup result plus the matched route's template and parameter names.
pub struct Found<'r, H> {
    pub handler: Lookup<'r, H>,
    /// Registered pattern of the matched route, e.g. `/users/:id`.
    pub path: Arc<str>,
    /// Parameter names of the matched route, in registration order.
    pub pnames: Arc<[String]>,
}

/// The application router.
///
/// Build it once at startup; lookups take `&self` and never lock.
pub struct Router<H> {
    nodes: Vec<Node<H>>,
    max_param: usize,
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self { nodes: vec![Node::new(Kind::Static, "", None)], max_param: 0 }
    }

    /// Largest number of parameters of any registered route.
    pub fn max_param(&self) -> usize {
        self.max_param
    }

    /// Registers `handler` for `method` + `path`.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is malformed (a catch-all that is not the last
    /// segment, or an unnamed parameter).
    pub fn add(&mut self, method: Method, path: &str, handler: H) {
        let mut path = if path.is_empty() {
            "/".to_owned()
        } else if !path.starts_with('/') {
            format!("/{path}")
        } else {
            path.to_owned()
        };
        let ppath: Arc<str> = Arc::from(path.as_str());
        let mut pnames: Vec<String> = Vec::new();
        let mut handler = Some(handler);

        let mut i = 0;
        let mut end = path.len();
        while i < end {
            match path.as_bytes()[i] {
                b':' => {
                    let j = i + 1;
                    self.insert(method, &path[..i], None, Kind::Static, None);
                    while i < end && path.as_bytes()[i] != b'/' {
                        i += 1;
                    }
                    let name = &path[j..i];
                    if name.is_empty() {
                        panic!("invalid route `{ppath}`: unnamed parameter");
                    }
                    pnames.push(name.to_owned());
                    // Collapse ":name" to ":" so every parameter shares one node.
                    path = format!("{}{}", &path[..j], &path[i..]);
                    i = j;
                    end = path.len();
                    if i == end {
                        let leaf = (Arc::clone(&ppath), Arc::from(pnames.clone()));
                        self.insert(method, &path[..i], handler.take(), Kind::Param, Some(leaf));
                    } else {
                        self.insert(method, &path[..i], None, Kind::Param, None);
                    }
                }
                b'*' => {
                    if i + 1 != end {
                        panic!("invalid route `{ppath}`: `*` must be the last segment");
                    }
                    self.insert(method, &path[..i], None, Kind::Static, None);
                    pnames.push("*".to_owned());
                    let leaf = (Arc::clone(&ppath), Arc::from(pnames.clone()));
                    self.insert(method, &path[..=i], handler.take(), Kind::Any, Some(leaf));
                    i += 1;
                }
                _ => i += 1,
            }
        }
        if handler.is_some() {
            let leaf = (ppath, Arc::from(pnames));
            self.insert(method, &path, handler, Kind::Static, Some(leaf));
        }
    }

    fn insert(
        &mut self,
        method: Method,
        path: &str,
        handler: Option<H>,
        kind: Kind,
        leaf: Option<(Arc<str>, Arc<[String]>)>,
    ) {
        if let Some((_, pnames)) = &leaf {
            self.max_param = self.max_param.max(pnames.len());
        }

        let mut cn = ROOT;
        let mut search = path;
        loop {
            let prefix = self.nodes[cn].prefix.as_str();
            let pl = prefix.len();
            let sl = search.len();
            let l = lcp(search, prefix);

            if l == 0 {
                // Only the empty root shares nothing with an incoming path.
                if cn != ROOT || pl != 0 || sl == 0 {
                    panic!("invalid route `{path}`: cannot split an empty tree");
                }
                let node = &mut self.nodes[cn];
                node.label = search.as_bytes()[0];
                node.prefix = search.to_owned();
                if let Some(h) = handler {
                    node.kind = kind;
                    node.handlers[method.index()] = Some(h);
                    if let Some((ppath, pnames)) = leaf {
                        node.ppath = ppath;
                        node.pnames = pnames;
                    }
                }
            } else if l < pl {
                // Split: the tail of the current node moves into a new child.
                let tail_idx = self.nodes.len();
                let node = &mut self.nodes[cn];
                let mut tail = Node::new(node.kind, &node.prefix[l..], Some(cn));
                tail.children = std::mem::take(&mut node.children);
                tail.handlers = std::mem::replace(&mut node.handlers, std::array::from_fn(|_| None));
                tail.ppath = std::mem::replace(&mut node.ppath, Arc::from(""));
                tail.pnames = std::mem::replace(&mut node.pnames, Arc::from(Vec::new()));
                node.kind = Kind::Static;
                node.prefix.truncate(l);
                node.label = node.prefix.as_bytes()[0];
                for &child in &tail.children {
                    self.nodes[child].parent = Some(tail_idx);
                }
                self.nodes.push(tail);
                self.add_child(cn, tail_idx);

                if l == sl {
                    let node = &mut self.nodes[cn];
                    node.kind = kind;
                    if let Some(h) = handler {
                        node.handlers[method.index()] = Some(h);
                    }
                    if let Some((ppath, pnames)) = leaf {
                        node.ppath = ppath;
                        node.pnames = pnames;
                    }
                } else {
                    self.new_leaf(cn, kind, &search[l..], method, handler, leaf);
                }
            } else if l < sl {
                search = &search[l..];
                let label = search.as_bytes()[0];
                if let Some(child) = self.child_with_label(cn, label) {
                    cn = child;
                    continue;
                }
                self.new_leaf(cn, kind, search, method, handler, leaf);
            } else if let Some(h) = handler {
                // Node already exists.
                let node = &mut self.nodes[cn];
                node.handlers[method.index()] = Some(h);
                if let Some((ppath, pnames)) = leaf {
                    node.ppath = ppath;
                    if node.pnames.is_empty() {
                        node.pnames = pnames;
                    }
                }
            }
            return;
        }
    }

    fn new_leaf(
        &mut self,
        parent: usize,
        kind: Kind,
        prefix: &str,
        method: Method,
        handler: Option<H>,
        leaf: Option<(Arc<str>, Arc<[String]>)>,
    ) {
        let mut node = Node::new(kind, prefix, Some(parent));
        if let Some(h) = handler {
            node.handlers[method.index()] = Some(h);
        }
        if let Some((ppath, pnames)) = leaf {
            node.ppath = ppath;
            node.pnames = pnames;
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.add_child(parent, idx);
    }

    fn add_child(&mut self, parent: usize, child: usize) {
        let kind = self.nodes[child].kind;
        let nodes = &self.nodes;
        let pos = nodes[parent].children.iter().position(|&c| nodes[c].kind > kind);
        let children = &mut self.nodes[parent].children;
        match pos {
            Some(pos) => children.insert(pos, child),
            None => children.push(child),
        }
    }

    fn child_with_label(&self, n: usize, label: u8) -> Option<usize> {
        self.nodes[n].children.iter().copied().find(|&c| self.nodes[c].label == label)
    }

    fn child(&self, n: usize, label: u8, kind: Kind) -> Option<usize> {
        self.nodes[n]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].label == label && self.nodes[c].kind == kind)
    }

    fn child_by_kind(&self, n: usize, kind: Kind) -> Option<usize> {
        self.nodes[n].children.iter().copied().find(|&c| self.nodes[c].kind == kind)
    }

    /// Looks up `method` + `path`, writing captured parameters into `pvalues`.
    ///
    /// `pvalues` should hold at least [`max_param`](Self::max_param) entries;
    /// a route needing more slots than provided does not match. Entries past
    /// the matched route's parameter count are cleared.
    pub fn find(&self, method: Method, path: &str, pvalues: &mut [String]) -> Found<'_, H> {
        let matched = if path.is_empty() {
            None
        } else {
            self.search(ROOT, path, 0, pvalues)
        };

        let Some(mut cn) = matched else {
            pvalues.iter_mut().for_each(String::clear);
            return Found {
                handler: Lookup::NotFound,
                path: Arc::from(""),
                pnames: Arc::from(Vec::new()),
            };
        };

        let mut handler = self.lookup_method(cn, method);
        if !matches!(handler, Lookup::Matched(_)) {
            // A catch-all below the matched node may accept an empty remainder.
            if let Some(any) = self.child_by_kind(cn, Kind::Any) {
                if self.nodes[any].has_handlers() {
                    let slot = self.nodes[any].pnames.len().saturating_sub(1);
                    if let Some(v) = pvalues.get_mut(slot) {
                        v.clear();
                    }
                    handler = self.lookup_method(any, method);
                    cn = any;
                }
            }
        }

        let node = &self.nodes[cn];
        for v in pvalues.iter_mut().skip(node.pnames.len()) {
            v.clear();
        }
        Found { handler, path: Arc::clone(&node.ppath), pnames: Arc::clone(&node.pnames) }
    }

    fn lookup_method(&self, n: usize, method: Method) -> Lookup<'_, H> {
        let node = &self.nodes[n];
        match &node.handlers[method.index()] {
            Some(h) => Lookup::Matched(h),
            None if node.has_handlers() => Lookup::MethodNotAllowed,
            None => Lookup::NotFound,
        }
    }

    /// Depth-first search with backtracking: static > param > any at each node.
    fn search(&self, n: usize, search: &str, np: usize, pvalues: &mut [String]) -> Option<usize> {
        let node = &self.nodes[n];
        let rest = match node.kind {
            Kind::Static => search.strip_prefix(node.prefix.as_str())?,
            Kind::Param => {
                let slot = pvalues.get_mut(np)?;
                let end = search.find('/').unwrap_or(search.len());
                slot.clear();
                slot.push_str(&search[..end]);
                &search[end..]
            }
            Kind::Any => {
                let slot = pvalues.get_mut(np)?;
                slot.clear();
                slot.push_str(search);
                return Some(n);
            }
        };
        let np = if node.kind == Kind::Param { np + 1 } else { np };

        if rest.is_empty() {
            if node.has_handlers() {
                return Some(n);
            }
            // Trailing edge: let a catch-all child take the empty remainder.
            if let Some(any) = self.child_by_kind(n, Kind::Any) {
                return self.search(any, rest, np, pvalues);
            }
            return None;
        }

        if let Some(child) = self.child(n, rest.as_bytes()[0], Kind::Static) {
            if let Some(found) = self.search(child, rest, np, pvalues) {
                return Some(found);
            }
        }
        if let Some(child) = self.child_by_kind(n, Kind::Param) {
            if let Some(found) = self.search(child, rest, np, pvalues) {
                return Some(found);
            }
        }
        if let Some(child) = self.child_by_kind(n, Kind::Any) {
            return self.search(child, rest, np, pvalues);
        }
        None
    }

    /// Lists every registered `(method, pattern)` pair.
    pub fn routes(&self) -> Vec<(Method, String)> {
        let mut out = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            for m in Method::ALL {
                if node.handlers[m.index()].is_some() {
                    out.push((m, node.ppath.to_string()));
                }
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn lcp(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(r: &Router<&'static str>) -> Vec<String> {
        vec![String::new(); r.max_param()]
    }

    fn hit<'a>(r: &'a Router<&'static str>, m: Method, p: &str, pv: &mut [String]) -> Option<&'a str> {
        match r.find(m, p, pv).handler {
            Lookup::Matched(h) => Some(*h),
            _ => None,
        }
    }

    #[test]
    fn static_routes() {
        let mut r = Router::new();
        r.add(Method::Get, "/", "root");
        r.add(Method::Get, "/users", "users");
        r.add(Method::Get, "/users/new", "new");
        r.add(Method::Get, "/uploads", "uploads");
        let mut pv = buf(&r);
        assert_eq!(hit(&r, Method::Get, "/", &mut pv), Some("root"));
        assert_eq!(hit(&r, Method::Get, "/users", &mut pv), Some("users"));
        assert_eq!(hit(&r, Method::Get, "/users/new", &mut pv), Some("new"));
        assert_eq!(hit(&r, Method::Get, "/uploads", &mut pv), Some("uploads"));
        assert_eq!(hit(&r, Method::Get, "/user", &mut pv), None);
    }

    #[test]
    fn captures_params_in_order() {
        let mut r = Router::new();
        r.add(Method::Get, "/users/:id/books/:bid", "book");
        let mut pv = buf(&r);
        let found = r.find(Method::Get, "/users/42/books/7", &mut pv);
        assert!(matches!(found.handler, Lookup::Matched(&"book")));
        assert_eq!(&*found.path, "/users/:id/books/:bid");
        assert_eq!(&*found.pnames, ["id".to_owned(), "bid".to_owned()]);
        assert_eq!(pv, vec!["42", "7"]);
    }

    #[test]
    fn static_beats_param_beats_any() {
        let mut r = Router::new();
        r.add(Method::Get, "/files/*", "any");
        r.add(Method::Get, "/files/:name", "param");
        r.add(Method::Get, "/files/readme", "static");
        let mut pv = buf(&r);
        assert_eq!(hit(&r, Method::Get, "/files/readme", &mut pv), Some("static"));
        assert_eq!(hit(&r, Method::Get, "/files/other", &mut pv), Some("param"));
        assert_eq!(pv[0], "other");
        assert_eq!(hit(&r, Method::Get, "/files/a/b", &mut pv), Some("any"));
        assert_eq!(pv[0], "a/b");
    }

    #[test]
    fn any_fallback() {
        let mut r = Router::new();
        r.add(Method::Get, "/static/*", "any");
        r.add(Method::Get, "/static/index.html", "index");
        let mut pv = buf(&r);
        assert_eq!(hit(&r, Method::Get, "/static/index.html", &mut pv), Some("index"));
        let found = r.find(Method::Get, "/static/css/app.css", &mut pv);
        assert!(matches!(found.handler, Lookup::Matched(&"any")));
        assert_eq!(&*found.pnames, ["*".to_owned()]);
        assert_eq!(pv[0], "css/app.css");
        assert_eq!(hit(&r, Method::Get, "/static/", &mut pv), Some("any"));
        assert_eq!(pv[0], "");
    }

    #[test]
    fn backtracks_out_of_a_dead_static_branch() {
        let mut r = Router::new();
        r.add(Method::Get, "/users/new/edit", "edit");
        r.add(Method::Get, "/users/:id", "show");
        let mut pv = buf(&r);
        assert_eq!(hit(&r, Method::Get, "/users/new", &mut pv), Some("show"));
        assert_eq!(pv[0], "new");
        assert_eq!(hit(&r, Method::Get, "/users/news", &mut pv), Some("show"));
        assert_eq!(pv[0], "news");
    }

    #[test]
    fn method_not_allowed_vs_not_found() {
        let mut r = Router::new();
        r.add(Method::Post, "/submit", "submit");
        let mut pv = buf(&r);
        assert!(matches!(r.find(Method::Get, "/submit", &mut pv).handler, Lookup::MethodNotAllowed));
        assert!(matches!(r.find(Method::Get, "/nowhere", &mut pv).handler, Lookup::NotFound));
    }

    #[test]
    fn split_keeps_existing_handlers() {
        let mut r = Router::new();
        r.add(Method::Get, "/contact", "contact");
        r.add(Method::Get, "/co", "co");
        r.add(Method::Get, "/c", "c");
        let mut pv = buf(&r);
        assert_eq!(hit(&r, Method::Get, "/contact", &mut pv), Some("contact"));
        assert_eq!(hit(&r, Method::Get, "/co", &mut pv), Some("co"));
        assert_eq!(hit(&r, Method::Get, "/c", &mut pv), Some("c"));
    }

    #[test]
    fn short_routes_leave_suffix_empty() {
        let mut r = Router::new();
        r.add(Method::Get, "/a/:x/:y/:z", "long");
        r.add(Method::Get, "/b/:x", "short");
        let mut pv = buf(&r);
        assert_eq!(r.max_param(), 3);
        hit(&r, Method::Get, "/a/1/2/3", &mut pv);
        assert_eq!(hit(&r, Method::Get, "/b/9", &mut pv), Some("short"));
        assert_eq!(pv, vec!["9", "", ""]);
    }

    #[test]
    fn registration_order_does_not_matter() {
        let paths = ["/users/:id", "/users/new", "/users/:id/posts", "/static/*", "/"];
        let mut forward = Router::new();
        let mut backward = Router::new();
        for p in paths {
            forward.add(Method::Get, p, p);
        }
        for p in paths.iter().rev() {
            backward.add(Method::Get, p, *p);
        }
        let mut a = buf(&forward);
        let mut b = buf(&backward);
        for probe in ["/users/1", "/users/new", "/users/1/posts", "/static/x/y", "/", "/nope"] {
            assert_eq!(hit(&forward, Method::Get, probe, &mut a), hit(&backward, Method::Get, probe, &mut b));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn lists_routes() {
        let mut r = Router::new();
        r.add(Method::Get, "/a", "a");
        r.add(Method::Post, "/a", "a");
        r.add(Method::Get, "/b/:id", "b");
        let mut routes = r.routes();
        routes.sort();
        assert_eq!(
            routes,
            vec![
                (Method::Get, "/a".to_owned()),
                (Method::Get, "/b/:id".to_owned()),
                (Method::Post, "/a".to_owned()),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "must be the last segment")]
    fn rejects_inner_wildcard() {
        Router::new().add(Method::Get, "/a/*/b", "x");
    }
}
