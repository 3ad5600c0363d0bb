//! Named testcases and the registry the runner selects them from

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use crate::error::Error;
use crate::invocation::Ctx;
use crate::lab::Lab;

/// A top-level testcase selectable by name
#[async_trait]
pub trait Testcase: Send + Sync {
    /// Name used on the command line
    fn name(&self) -> &'static str;

    /// One-line description for `tendlab list`
    fn description(&self) -> &'static str;

    /// Run against `lab`
    ///
    /// Machines opened through `lab` stay open for later testcases of the
    /// same run.
    async fn run(&self, ctx: &Ctx, lab: &mut Lab) -> Result<(), Error>;
}

/// Testcases by name
#[derive(Default)]
pub struct Registry {
    cases: BTreeMap<&'static str, Box<dyn Testcase>>,
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in selftests
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::selftest::register(&mut registry);
        registry
    }

    /// Add a testcase, replacing one with the same name
    pub fn register(&mut self, testcase: Box<dyn Testcase>) {
        self.cases.insert(testcase.name(), testcase);
    }

    /// Look up a testcase
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Testcase> {
        self.cases.get(name).map(|case| &**case)
    }

    /// All testcases, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &dyn Testcase> {
        self.cases.values().map(|case| &**case)
    }

    /// Run the named testcases in order, stopping at the first failure
    ///
    /// All names are resolved before anything runs.
    ///
    /// # Errors
    /// `UnknownTestcase`, or the first testcase failure
    pub async fn run(&self, ctx: &Ctx, lab: &mut Lab, names: &[String]) -> Result<(), Error> {
        let selected = names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| Error::UnknownTestcase(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for testcase in selected {
            ctx.testcase(testcase.name(), &[], async |ctx| testcase.run(ctx, lab).await)
                .await?;
        }

        info!(count = names.len(), "all testcases passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Config;
    use crate::invocation::LogSink;

    struct Counting {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Testcase for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "counts its runs"
        }

        async fn run(&self, _ctx: &Ctx, _lab: &mut Lab) -> Result<(), Error> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Assertion(format!("{} failed", self.name)));
            }
            Ok(())
        }
    }

    fn registry(runs: &Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::new();
        for (name, fail) in [("first", false), ("broken", true), ("last", false)] {
            registry.register(Box::new(Counting {
                name,
                runs: Arc::clone(runs),
                fail,
            }));
        }
        registry
    }

    #[tokio::test]
    async fn test_unknown_names_fail_before_running() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = registry(&runs);
        let ctx = Ctx::root(LogSink::new());
        let mut lab = Lab::new(Config::new(), ctx.sink().clone());

        let err = registry
            .run(&ctx, &mut lab, &["first".into(), "nope".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownTestcase(name) if name == "nope"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = registry(&runs);
        let ctx = Ctx::root(LogSink::new());
        let mut lab = Lab::new(Config::new(), ctx.sink().clone());

        let err = registry
            .run(&ctx, &mut lab, &["first".into(), "broken".into(), "last".into()])
            .await
            .unwrap_err();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(err.trace().unwrap()[0].name, "broken");
        assert_eq!(ctx.sink().open_frames(), 0);
    }

    #[test]
    fn test_builtins_are_listed_sorted() {
        let registry = Registry::with_builtins();
        let names: Vec<_> = registry.iter().map(|t| t.name()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();

        assert_eq!(names, sorted);
        assert!(registry.get("selftest_version").is_some());
        assert!(registry.iter().all(|t| !t.description().is_empty()));
    }
}
