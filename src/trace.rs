//! Simulation traces and lazily evaluated sites.
//!
//! A [`Trace`] is the record of one simulation run: an insertion-ordered,
//! write-once map from variable name to [`Value`]. It doubles as the memo
//! table of a small DAG whose nodes are registered with [`Trace::sample`] and
//! [`Trace::sample_dist`]. Registration returns [`LazyValue`] handles that can
//! be passed as arguments to later sites; edges are discovered only when a
//! node is evaluated.
//!
//! # Evaluation
//!
//! ```text
//! evaluate(node, name)
//!   ├─ name already in trace?  ── yes ──> stored value (no call)
//!   ├─ resolve args depth-first (positional, then keyword)
//!   ├─ call site function once, distribute outputs over all its names
//!   └─ distribution site + log-prob collection ──> "<name>:log_prob"
//! ```
//!
//! Because a handle can only exist after its node was registered, every
//! argument refers to an earlier node and the graph is acyclic by
//! construction.
//!
//! Sites whose names are not requested targets are registered but not
//! evaluated; they run only if something downstream consumes them. Values
//! pre-filled from conditions stop evaluation at the point they are consumed.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use uuid::Uuid;

use crate::error::{SimError, SimResult, TraceError};
use crate::samples::Sample;
use crate::value::Value;

/// Random number generator threaded through every site evaluation.
pub type SimRng = StdRng;

/// Suffix of the trace entry holding a distribution site's log-probability.
pub const LOG_PROB_SUFFIX: &str = ":log_prob";

/// Name of the log-probability entry for `name`.
#[must_use]
pub fn log_prob_key(name: &str) -> String {
    format!("{name}{LOG_PROB_SUFFIX}")
}

/// One or several output names of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Names {
    One(String),
    Many(Vec<String>),
}

impl Names {
    fn as_slice(&self) -> &[String] {
        match self {
            Self::One(name) => std::slice::from_ref(name),
            Self::Many(names) => names,
        }
    }

    fn validate(&self) -> Result<(), TraceError> {
        let names = self.as_slice();
        if names.is_empty() {
            return Err(TraceError::invalid("site names must not be empty"));
        }
        let mut seen = IndexSet::with_capacity(names.len());
        for name in names {
            if name.is_empty() {
                return Err(TraceError::invalid("site name must not be an empty string"));
            }
            if !seen.insert(name.as_str()) {
                return Err(TraceError::invalid(format!("duplicate site name '{name}'")));
            }
        }
        Ok(())
    }
}

/// Name arguments accepted by [`Trace::sample`].
///
/// A single name yields one [`LazyValue`]; an array or vector of names yields
/// one handle per name, all backed by the same call.
pub trait SiteNames {
    /// Handles returned for these names.
    type Handles;

    /// Converts into the untyped name list.
    fn into_names(self) -> Names;

    /// Shapes the registered handles into [`Self::Handles`].
    fn into_handles(handles: Vec<LazyValue>) -> SimResult<Self::Handles>;
}

fn single_handle(handles: Vec<LazyValue>) -> SimResult<LazyValue> {
    handles
        .into_iter()
        .next()
        .ok_or_else(|| SimError::internal("site registered without a handle"))
}

impl SiteNames for &str {
    type Handles = LazyValue;

    fn into_names(self) -> Names {
        Names::One(self.to_string())
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<LazyValue> {
        single_handle(handles)
    }
}

impl SiteNames for String {
    type Handles = LazyValue;

    fn into_names(self) -> Names {
        Names::One(self)
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<LazyValue> {
        single_handle(handles)
    }
}

impl<const N: usize> SiteNames for [&str; N] {
    type Handles = [LazyValue; N];

    fn into_names(self) -> Names {
        Names::Many(self.iter().map(|s| (*s).to_string()).collect())
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<[LazyValue; N]> {
        handles
            .try_into()
            .map_err(|v: Vec<LazyValue>| SimError::internal(format!("expected {N} handles, got {}", v.len())))
    }
}

impl SiteNames for Vec<&str> {
    type Handles = Vec<LazyValue>;

    fn into_names(self) -> Names {
        Names::Many(self.into_iter().map(str::to_string).collect())
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<Vec<LazyValue>> {
        Ok(handles)
    }
}

impl SiteNames for Vec<String> {
    type Handles = Vec<LazyValue>;

    fn into_names(self) -> Names {
        Names::Many(self)
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<Vec<LazyValue>> {
        Ok(handles)
    }
}

impl SiteNames for Names {
    type Handles = Vec<LazyValue>;

    fn into_names(self) -> Names {
        self
    }

    fn into_handles(handles: Vec<LazyValue>) -> SimResult<Vec<LazyValue>> {
        Ok(handles)
    }
}

/// A site argument: a known value or a deferred node output.
#[derive(Debug, Clone)]
pub enum Arg {
    Eager(Value),
    Deferred(LazyValue),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Eager(value)
    }
}

impl From<&Value> for Arg {
    fn from(value: &Value) -> Self {
        Self::Eager(value.clone())
    }
}

impl From<LazyValue> for Arg {
    fn from(lazy: LazyValue) -> Self {
        Self::Deferred(lazy)
    }
}

impl From<&LazyValue> for Arg {
    fn from(lazy: &LazyValue) -> Self {
        Self::Deferred(lazy.clone())
    }
}

macro_rules! impl_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(x: $ty) -> Self {
                    Self::Eager(Value::from(x))
                }
            }
        )*
    };
}

impl_arg_from!(f32, f64, i32, i64, ArrayD<f32>, ArrayD<f64>, ArrayD<i32>, ArrayD<i64>);

/// Positional and keyword arguments of a site.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Arg>,
    keyword: Vec<(String, Arg)>,
}

impl Args {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.positional.push(arg.into());
        self
    }

    /// Appends a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.keyword.push((name.into(), arg.into()));
        self
    }

    /// Returns true if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// Materialised arguments handed to a site function.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    positional: Vec<Value>,
    keyword: IndexMap<String, Value>,
}

impl Inputs {
    /// Positional argument at `index`.
    pub fn get(&self, index: usize) -> SimResult<&Value> {
        self.positional.get(index).ok_or_else(|| {
            TraceError::invalid(format!(
                "missing positional argument {index} (got {})",
                self.positional.len()
            ))
            .into()
        })
    }

    /// Keyword argument `name`.
    pub fn keyword(&self, name: &str) -> SimResult<&Value> {
        self.keyword
            .get(name)
            .ok_or_else(|| TraceError::invalid(format!("missing keyword argument '{name}'")).into())
    }

    /// Positional argument at `index`, converted to `f64`.
    pub fn f64(&self, index: usize) -> SimResult<ArrayD<f64>> {
        self.get(index).map(Value::to_f64)
    }

    /// Keyword argument `name`, converted to `f64`.
    pub fn keyword_f64(&self, name: &str) -> SimResult<ArrayD<f64>> {
        self.keyword(name).map(Value::to_f64)
    }

    /// All positional arguments in order.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Number of positional arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Returns true if there are no positional arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }
}

/// Result of one site call: one value, or one per output name.
#[derive(Debug, Clone)]
pub enum Outcome {
    One(Value),
    Many(Vec<Value>),
}

impl Outcome {
    fn into_values(self) -> Vec<Value> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(vs) => vs,
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::One(value)
    }
}

impl From<Vec<Value>> for Outcome {
    fn from(values: Vec<Value>) -> Self {
        Self::Many(values)
    }
}

impl From<(Value, Value)> for Outcome {
    fn from((a, b): (Value, Value)) -> Self {
        Self::Many(vec![a, b])
    }
}

impl From<(Value, Value, Value)> for Outcome {
    fn from((a, b, c): (Value, Value, Value)) -> Self {
        Self::Many(vec![a, b, c])
    }
}

macro_rules! impl_outcome_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Outcome {
                fn from(x: $ty) -> Self {
                    Self::One(Value::from(x))
                }
            }
        )*
    };
}

impl_outcome_from!(f32, f64, i32, i64, ArrayD<f32>, ArrayD<f64>, ArrayD<i32>, ArrayD<i64>);

/// A distribution-like object built by a [`Trace::sample_dist`] site.
///
/// The site calls the builder with its resolved inputs, draws the stored
/// value with [`SiteDistribution::sample`] and, when log-probability
/// collection is on, scores it with [`SiteDistribution::log_prob`].
pub trait SiteDistribution {
    /// Draws a value (or one value per site name).
    fn sample(&self, rng: &mut SimRng) -> SimResult<Outcome>;

    /// Log-probability of `value` under this distribution.
    fn log_prob(&self, value: &Value) -> SimResult<Value>;
}

type PlainFn = dyn Fn(&Inputs, &mut SimRng) -> SimResult<Outcome>;
type DistributionFn = dyn Fn(&Inputs) -> SimResult<Box<dyn SiteDistribution>>;

enum SiteCall {
    Plain(Box<PlainFn>),
    Distribution(Box<DistributionFn>),
}

struct Node {
    out_names: Vec<String>,
    args: Args,
    call: SiteCall,
}

/// Handle to one output of a registered site.
#[derive(Clone)]
pub struct LazyValue {
    trace_id: Uuid,
    node: usize,
    name: String,
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyValue")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl LazyValue {
    /// Fully prefixed trace name this handle stands for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the backing site (once) and returns this output.
    pub fn value(&self, trace: &mut Trace) -> SimResult<Value> {
        trace.evaluate(self)
    }
}

/// Record of one simulation run and memo table of its site DAG.
pub struct Trace {
    id: Uuid,
    entries: IndexMap<String, Value>,
    targets: Option<IndexSet<String>>,
    prefix: String,
    collect_log_prob: bool,
    nodes: Vec<Rc<Node>>,
    rng: SimRng,
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("targets", &self.targets)
            .field("prefix", &self.prefix)
            .field("collect_log_prob", &self.collect_log_prob)
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl Trace {
    /// An empty trace evaluating every site, without log-probabilities.
    #[must_use]
    pub fn new(rng: SimRng) -> Self {
        Self {
            id: Uuid::new_v4(),
            entries: IndexMap::new(),
            targets: None,
            prefix: String::new(),
            collect_log_prob: false,
            nodes: Vec::new(),
            rng,
        }
    }

    /// Restricts evaluation to what is needed for `targets`.
    #[must_use]
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Pre-fills entries; sites producing these names will not run.
    #[must_use]
    pub fn with_conditions(mut self, conditions: Sample) -> Self {
        for (name, value) in conditions {
            self.insert(name, value);
        }
        self
    }

    /// Enables or disables log-probability collection for distribution sites.
    #[must_use]
    pub fn with_log_prob(mut self, enabled: bool) -> Self {
        self.collect_log_prob = enabled;
        self
    }

    /// Value recorded under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Returns true if `name` is recorded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Recorded entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Records `value` under `name` unless the name is already present.
    ///
    /// Returns whether the value was stored. Existing entries are never
    /// overwritten.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> bool {
        match self.entries.entry(name.into()) {
            indexmap::map::Entry::Occupied(_) => false,
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Requested targets, `None` when every site is evaluated.
    #[must_use]
    pub fn targets(&self) -> Option<&IndexSet<String>> {
        self.targets.as_ref()
    }

    /// True iff targets were given and all of them are recorded.
    #[must_use]
    pub fn covers_targets(&self) -> bool {
        self.targets
            .as_ref()
            .is_some_and(|targets| targets.iter().all(|t| self.entries.contains_key(t)))
    }

    /// Targets that are not recorded yet.
    #[must_use]
    pub fn missing_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .flatten()
            .filter(|t| !self.entries.contains_key(*t))
            .cloned()
            .collect()
    }

    /// Prefix currently applied to registered names.
    #[must_use]
    pub fn current_prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns true if distribution sites record log-probabilities.
    #[must_use]
    pub const fn collects_log_prob(&self) -> bool {
        self.collect_log_prob
    }

    /// The run's random number generator.
    pub fn rng(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    /// Consumes the trace into its recorded entries.
    #[must_use]
    pub fn into_sample(self) -> Sample {
        self.entries
    }

    /// Registers a site computed by `f`.
    ///
    /// `names` is a single name or a list of names; with a list, `f` must
    /// return one value per name. The site is evaluated immediately when no
    /// targets were requested or when one of its names is a target.
    pub fn sample<N, F, O>(&mut self, names: N, args: Args, f: F) -> SimResult<N::Handles>
    where
        N: SiteNames,
        F: Fn(&Inputs, &mut SimRng) -> SimResult<O> + 'static,
        O: Into<Outcome>,
    {
        let call = SiteCall::Plain(Box::new(move |inputs, rng| f(inputs, rng).map(Into::into)));
        let handles = self.register(names.into_names(), args, call)?;
        N::into_handles(handles)
    }

    /// Registers a site whose value is drawn from the distribution `build`
    /// returns.
    pub fn sample_dist<N, F, D>(&mut self, names: N, args: Args, build: F) -> SimResult<N::Handles>
    where
        N: SiteNames,
        F: Fn(&Inputs) -> SimResult<D> + 'static,
        D: SiteDistribution + 'static,
    {
        let call = SiteCall::Distribution(Box::new(move |inputs| {
            build(inputs).map(|d| Box::new(d) as Box<dyn SiteDistribution>)
        }));
        let handles = self.register(names.into_names(), args, call)?;
        N::into_handles(handles)
    }

    fn register(&mut self, names: Names, args: Args, call: SiteCall) -> SimResult<Vec<LazyValue>> {
        names.validate()?;
        let out_names: Vec<String> = names
            .as_slice()
            .iter()
            .map(|n| format!("{}{n}", self.prefix))
            .collect();

        let node = self.nodes.len();
        let handles: Vec<LazyValue> = out_names
            .iter()
            .map(|name| LazyValue {
                trace_id: self.id,
                node,
                name: name.clone(),
            })
            .collect();

        let requested = self
            .targets
            .as_ref()
            .map_or(true, |targets| out_names.iter().any(|n| targets.contains(n)));

        self.nodes.push(Rc::new(Node {
            out_names,
            args,
            call,
        }));

        if requested {
            if let Some(first) = handles.first() {
                self.evaluate(first)?;
            }
        }
        Ok(handles)
    }

    /// Evaluates the site behind `lazy` if its output is not yet recorded.
    ///
    /// Repeated evaluation returns the stored value without calling the site
    /// function again.
    pub fn evaluate(&mut self, lazy: &LazyValue) -> SimResult<Value> {
        if lazy.trace_id != self.id {
            return Err(TraceError::ForeignLazyValue {
                name: lazy.name.clone(),
            }
            .into());
        }
        let node = self
            .nodes
            .get(lazy.node)
            .cloned()
            .ok_or_else(|| SimError::internal(format!("unknown node {} for '{}'", lazy.node, lazy.name)))?;

        let mut instance: Option<Box<dyn SiteDistribution>> = None;
        if !self.entries.contains_key(&lazy.name) {
            let inputs = self.resolve_inputs(&node.args)?;
            let outcome = match &node.call {
                SiteCall::Plain(f) => f(&inputs, &mut self.rng)?,
                SiteCall::Distribution(build) => {
                    let dist = build(&inputs)?;
                    let drawn = dist.sample(&mut self.rng)?;
                    instance = Some(dist);
                    drawn
                }
            };
            let values = outcome.into_values();
            if values.len() != node.out_names.len() {
                return Err(TraceError::ArityMismatch {
                    names: node.out_names.clone(),
                    expected: node.out_names.len(),
                    actual: values.len(),
                }
                .into());
            }
            for (name, value) in node.out_names.iter().zip(values) {
                self.insert(name.clone(), value);
            }
        }

        if let SiteCall::Distribution(build) = &node.call {
            let key = log_prob_key(&lazy.name);
            if self.collect_log_prob && node.out_names.len() == 1 && !self.entries.contains_key(&key) {
                let dist = match instance {
                    Some(dist) => dist,
                    None => {
                        let inputs = self.resolve_inputs(&node.args)?;
                        build(&inputs)?
                    }
                };
                let value = self.stored(&lazy.name)?;
                let log_prob = dist.log_prob(&value)?;
                self.insert(key, log_prob);
            }
        }

        self.stored(&lazy.name)
    }

    fn stored(&self, name: &str) -> SimResult<Value> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::internal(format!("site did not record '{name}'")))
    }

    fn resolve_inputs(&mut self, args: &Args) -> SimResult<Inputs> {
        let mut inputs = Inputs::default();
        for arg in &args.positional {
            let value = self.resolve(arg)?;
            inputs.positional.push(value);
        }
        for (name, arg) in &args.keyword {
            let value = self.resolve(arg)?;
            inputs.keyword.insert(name.clone(), value);
        }
        Ok(inputs)
    }

    fn resolve(&mut self, arg: &Arg) -> SimResult<Value> {
        match arg {
            Arg::Eager(value) => Ok(value.clone()),
            Arg::Deferred(lazy) => self.evaluate(lazy),
        }
    }

    /// Appends `prefix` to the active prefix until the returned scope drops.
    ///
    /// Scopes nest: `prefix("a")` inside `prefix("b")` registers names as
    /// `"ba<name>"`. The previous prefix is restored on every exit path,
    /// including early returns through `?` and unwinding.
    pub fn prefix(&mut self, prefix: &str) -> PrefixScope<'_> {
        let saved = self.prefix.clone();
        self.prefix.push_str(prefix);
        PrefixScope { trace: self, saved }
    }

    /// Runs `f` with `prefix` active.
    pub fn with_prefix<R>(&mut self, prefix: &str, f: impl FnOnce(&mut Trace) -> R) -> R {
        let mut scope = self.prefix(prefix);
        f(&mut scope)
    }
}

/// Active name prefix; restores the previous prefix when dropped.
pub struct PrefixScope<'t> {
    trace: &'t mut Trace,
    saved: String,
}

impl Deref for PrefixScope<'_> {
    type Target = Trace;

    fn deref(&self) -> &Trace {
        self.trace
    }
}

impl DerefMut for PrefixScope<'_> {
    fn deref_mut(&mut self) -> &mut Trace {
        self.trace
    }
}

impl Drop for PrefixScope<'_> {
    fn drop(&mut self) {
        self.trace.prefix = std::mem::take(&mut self.saved);
    }
}
