//! Controller dispatch: typed methods on a user type served as handlers.
//!
//! A controller lists its methods once. Each method receives a fresh
//! controller value, the request context and a request object that has been
//! bound and verified:
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct User;
//!
//! impl Controller for User {
//!     fn register(m: &mut Methods<Self>) {
//!         m.method("Login", Self::login);
//!         m.action("Logout", Self::logout);
//!     }
//! }
//!
//! impl User {
//!     fn login<'a>(&'a mut self, c: &'a mut Context, req: &'a LoginRequest) -> BoxFuture<'a, Result<Token>> {
//!         Box::pin(async move { Ok(Token { token: issue(&req.username) }) })
//!     }
//! }
//!
//! server.post("/user/login", controller::handler::<User>());   // name from the path
//! server.controller::<User>(Method::Post, "/user");             // every method
//! ```
//!
//! Method names are snake-cased at registration (`Login` → `login`,
//! `GetUser` → `get_user`).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;

use crate::bind::Bind;
use crate::context::Context;
use crate::error::{HttpError, Result};
use crate::handler::{Handler, HandlerFuture};

/// Validation hooks of a controller request type.
pub trait Verify {
    /// Rejects the request before the method runs; the error is returned as is.
    fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Runs after the method, whatever its outcome.
    fn clear(&mut self) {}
}

/// A type whose methods are served as handlers.
pub trait Controller: Default + Send + 'static {
    fn register(methods: &mut Methods<Self>);
}

trait Invoke<T>: Send + Sync {
    fn invoke<'a>(&'a self, recv: &'a mut T, c: &'a mut Context) -> HandlerFuture<'a>;
}

struct Typed<F, Req, Resp> {
    f: F,
    forward: bool,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<T, F, Req, Resp> Invoke<T> for Typed<F, Req, Resp>
where
    T: Send + 'static,
    Req: Bind + Verify + Send + Sync + 'static,
    Resp: Serialize + Send + 'static,
    F: for<'a> Fn(&'a mut T, &'a mut Context, &'a Req) -> BoxFuture<'a, Result<Resp>> + Send + Sync + 'static,
{
    fn invoke<'a>(&'a self, recv: &'a mut T, c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let req = Cleared(c.bind::<Req>().await?);
            req.0.verify()?;
            let out = (self.f)(recv, c, &req.0).await?;
            if self.forward {
                c.ok(&out)?;
            }
            Ok(())
        })
    }
}

/// Calls `clear` when the request object goes out of scope.
struct Cleared<R: Verify>(R);

impl<R: Verify> Drop for Cleared<R> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// The method table of one controller type.
pub struct Methods<T> {
    table: HashMap<String, Arc<dyn Invoke<T>>>,
}

impl<T: Send + 'static> Methods<T> {
    fn new() -> Self {
        Self { table: HashMap::new() }
    }

    /// Registers a method whose result is sent through the server's OK handler.
    ///
    /// # Panics
    ///
    /// Panics when the snake-cased name is already registered.
    pub fn method<Req, Resp, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        Req: Bind + Verify + Send + Sync + 'static,
        Resp: Serialize + Send + 'static,
        F: for<'a> Fn(&'a mut T, &'a mut Context, &'a Req) -> BoxFuture<'a, Result<Resp>> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(Typed { f, forward: true, _marker: PhantomData }))
    }

    /// Registers a method that writes its own response.
    ///
    /// # Panics
    ///
    /// Panics when the snake-cased name is already registered.
    pub fn action<Req, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        Req: Bind + Verify + Send + Sync + 'static,
        F: for<'a> Fn(&'a mut T, &'a mut Context, &'a Req) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(Typed { f, forward: false, _marker: PhantomData }))
    }

    fn insert(&mut self, name: &str, invoke: Arc<dyn Invoke<T>>) -> &mut Self {
        let key = snake_case(name);
        if self.table.insert(key.clone(), invoke).is_some() {
            panic!("controller {}: duplicate method `{key}`", std::any::type_name::<T>());
        }
        self
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

type Cache = RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

static TABLES: OnceLock<Cache> = OnceLock::new();

/// The method table of `T`, built on first use.
fn table<T: Controller>() -> Arc<Methods<T>> {
    let cache = TABLES.get_or_init(Cache::default);
    let cached = cache.read().get(&TypeId::of::<T>()).cloned();
    if let Some(t) = cached.and_then(|t| t.downcast::<Methods<T>>().ok()) {
        return t;
    }

    let mut methods = Methods::new();
    T::register(&mut methods);
    let built = Arc::new(methods);
    let entry = Arc::clone(
        cache
            .write()
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::clone(&built) as Arc<dyn Any + Send + Sync>),
    );
    entry.downcast::<Methods<T>>().unwrap_or(built)
}

/// Names registered by controller `T`, sorted.
pub fn names<T: Controller>() -> Vec<String> {
    table::<T>().names().into_iter().map(str::to_owned).collect()
}

struct Dispatcher<T> {
    name: Option<String>,
    methods: Arc<Methods<T>>,
}

impl<T: Controller> Handler for Dispatcher<T> {
    fn call<'a>(&'a self, c: &'a mut Context) -> HandlerFuture<'a> {
        Box::pin(async move {
            let name = match &self.name {
                Some(n) => n.clone(),
                None => method_name(c),
            };
            let Some(invoke) = self.methods.table.get(&name) else {
                return Err(HttpError::not_found().into());
            };
            let mut recv = T::default();
            invoke.invoke(&mut recv, c).await
        })
    }
}

/// A handler that picks the method from the last segment of the matched
/// route. A trailing slash is ignored; a `:param` segment uses the captured
/// value.
pub fn handler<T: Controller>() -> impl Handler {
    Dispatcher { name: None, methods: table::<T>() }
}

/// A handler bound to one method.
pub fn handler_named<T: Controller>(name: &str) -> impl Handler {
    Dispatcher { name: Some(snake_case(name)), methods: table::<T>() }
}

fn method_name(c: &Context) -> String {
    let last = c.path().trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let segment = match last.strip_prefix(':') {
        Some(param) => c.param(param),
        None => last,
    };
    snake_case(segment)
}

/// `GetUser` → `get_user`, `HTTPServer` → `http_server`; `-` becomes `_`.
pub(crate) fn snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
                if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                    out.push('_');
                }
            }
            out.extend(ch.to_lowercase());
        } else if ch == '-' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::bind::Field;
    use crate::error::Error;
    use crate::request::Request;

    static CLEARED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct LoginRequest {
        username: String,
        password: String,
    }

    impl Bind for LoginRequest {
        fn fields() -> Vec<Field> {
            vec![Field::new("username").from("form"), Field::new("password").from("form")]
        }
    }

    impl Verify for LoginRequest {
        fn verify(&self) -> Result<()> {
            if self.username.is_empty() {
                return Err(HttpError::new(400, "username required").into());
            }
            Ok(())
        }

        fn clear(&mut self) {
            CLEARED.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Serialize)]
    struct Token {
        token: String,
    }

    #[derive(Default)]
    struct Account;

    impl Controller for Account {
        fn register(m: &mut Methods<Self>) {
            m.method("Login", Self::login);
            m.action("SignOut", Self::sign_out);
        }
    }

    impl Account {
        fn login<'a>(&'a mut self, _c: &'a mut Context, req: &'a LoginRequest) -> BoxFuture<'a, Result<Token>> {
            Box::pin(async move {
                if req.password != "b" {
                    return Err(HttpError::new(200, "bad password").with_errno(10003).into());
                }
                Ok(Token { token: format!("{}-token", req.username) })
            })
        }

        fn sign_out<'a>(&'a mut self, c: &'a mut Context, _req: &'a LoginRequest) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { c.no_content(204) })
        }
    }

    fn form(path: &str, body: &'static str) -> Context {
        let mut c = Context::new(
            Request::new(http::Method::POST, path)
                .with_header("content-type", "application/x-www-form-urlencoded")
                .with_body(body),
        );
        c.set_path(path);
        c
    }

    #[test]
    fn snake_cases_names() {
        assert_eq!(snake_case("Login"), "login");
        assert_eq!(snake_case("GetUser"), "get_user");
        assert_eq!(snake_case("HTTPServer"), "http_server");
        assert_eq!(snake_case("UserID"), "user_id");
        assert_eq!(snake_case("get_user"), "get_user");
        assert_eq!(snake_case("sign-out"), "sign_out");
    }

    #[test]
    fn table_is_cached() {
        assert!(Arc::ptr_eq(&table::<Account>(), &table::<Account>()));
        assert_eq!(names::<Account>(), ["login", "sign_out"]);
    }

    #[test]
    #[should_panic(expected = "duplicate method `login`")]
    fn duplicate_names_panic() {
        let mut m = Methods::<Account>::new();
        m.method("Login", Account::login);
        m.method("login", Account::login);
    }

    #[tokio::test]
    async fn dispatches_by_last_segment() {
        let before = CLEARED.load(Ordering::SeqCst);
        let mut c = form("/user/login/", "username=a&password=b");
        handler::<Account>().call(&mut c).await.unwrap();
        assert_eq!(c.response().body(), br#"{"errno":0,"data":{"token":"a-token"}}"#);
        assert!(CLEARED.load(Ordering::SeqCst) > before);
    }

    #[tokio::test]
    async fn explicit_name_and_actions() {
        let mut c = form("/anything", "username=a");
        handler_named::<Account>("SignOut").call(&mut c).await.unwrap();
        assert_eq!(c.response().status(), 204);
    }

    #[tokio::test]
    async fn verify_and_method_errors_pass_through() {
        let mut c = form("/user/login", "password=b");
        let err = handler::<Account>().call(&mut c).await.unwrap_err();
        assert_eq!(err.as_http().map(|h| h.message.as_str()), Some("username required"));

        let mut c = form("/user/login", "username=a&password=x");
        match handler::<Account>().call(&mut c).await {
            Err(Error::Http(he)) => assert_eq!((he.code, he.errno), (200, 10003)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let mut c = form("/user/nothing", "");
        let err = handler::<Account>().call(&mut c).await.unwrap_err();
        assert_eq!(err.as_http().map(|h| h.code), Some(404));
    }
}
