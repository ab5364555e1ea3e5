use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::Failure;
use crate::scheduler::RuleContext;
use crate::types::{TypeKey, Value};

/// A recursive request a rule body may make at runtime: a `product`,
/// computed with an additional parameter of type `provided`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Get {
    pub product: TypeKey,
    pub provided: TypeKey,
}

impl fmt::Display for Get {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Get({}, {})", self.product, self.provided)
    }
}

/// A declared dependency of a [Rule].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKey {
    /// A positional input, resolved before the body runs.
    Input(TypeKey),
    /// A recursive request, made by the body itself.
    Get(Get),
}

/// The body of a [Rule].
///
/// Bodies must be deterministic given their inputs and parameters. They get
/// their positional inputs in declaration order.
pub trait RuleBody: Send + Sync + 'static {
    fn run(&self, ctx: RuleContext, inputs: Vec<Value>) -> BoxFuture<'static, Result<Value, Failure>>;
}

impl<F, Fut> RuleBody for F
where
    F: Fn(RuleContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
{
    fn run(&self, ctx: RuleContext, inputs: Vec<Value>) -> BoxFuture<'static, Result<Value, Failure>> {
        (self)(ctx, inputs).boxed()
    }
}

/// A function producing a value of type `output` from its dependencies.
#[derive(Clone)]
pub struct Rule {
    name: String,
    output: TypeKey,
    dependencies: Vec<DependencyKey>,
    body: Arc<dyn RuleBody>,
}

impl Rule {
    /// Creates a rule producing `Out`. Dependencies are declared with
    /// [Rule::input] and [Rule::get].
    pub fn new<Out: 'static>(name: impl Into<String>, body: impl RuleBody) -> Self {
        Self {
            name: name.into(),
            output: TypeKey::of::<Out>(),
            dependencies: vec![],
            body: Arc::new(body),
        }
    }

    /// Declares the next positional input.
    pub fn input<T: 'static>(mut self) -> Self {
        self.dependencies
            .push(DependencyKey::Input(TypeKey::of::<T>()));
        self
    }

    /// Declares that the body may request a `Product` for a `Provided`
    /// parameter via [RuleContext::get].
    pub fn get<Product: 'static, Provided: 'static>(mut self) -> Self {
        self.dependencies.push(DependencyKey::Get(Get {
            product: TypeKey::of::<Product>(),
            provided: TypeKey::of::<Provided>(),
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> TypeKey {
        self.output
    }

    pub fn dependencies(&self) -> &[DependencyKey] {
        &self.dependencies
    }

    pub(crate) fn body(&self) -> &dyn RuleBody {
        self.body.as_ref()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
