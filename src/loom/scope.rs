use std::{
    collections::{BTreeMap, HashMap},
    hash::BuildHasher,
};

use derive_more::Display;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{error::UsageError, num::DataBuffer, tensor::Tensor, tensor::TensorId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeMarker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("scope#{}", _0.get())]
pub struct ScopeId(uid::Id<ScopeMarker>);

impl ScopeId {
    #[inline]
    fn new() -> Self {
        Self(uid::Id::new())
    }
}

#[derive(Debug)]
struct Frame {
    parent: Option<ScopeId>,
    name: Option<String>,
    /// Tensors owned by this scope, in creation order.
    tensors: Vec<TensorId>,
}

/// Ownership of tensors by nested scopes.
///
/// Every tracked tensor is owned by exactly one open scope, recorded at creation
/// time by id. Scopes usually close in stack order, but an asynchronous scope may
/// close after a scope opened later; ownership then moves to the nearest ancestor
/// that is still open. The root scope never owns anything and is never closed.
#[derive(Debug)]
pub struct ScopeStack {
    root: ScopeId,
    frames: FxHashMap<ScopeId, Frame>,
    /// Open scopes in the order they were opened.
    active: Vec<ScopeId>,
    owners: FxHashMap<TensorId, ScopeId>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        let root = ScopeId::new();
        let frame = Frame {
            parent: None,
            name: Some("root".into()),
            tensors: vec![],
        };
        let mut frames = FxHashMap::default();
        frames.insert(root, frame);
        Self {
            root,
            frames,
            active: vec![root],
            owners: FxHashMap::default(),
        }
    }

    #[inline]
    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// The most recently opened scope that is still open.
    #[inline]
    pub fn active(&self) -> ScopeId {
        self.active.last().copied().unwrap_or(self.root)
    }

    /// Number of open scopes above the root.
    #[inline]
    pub fn depth(&self) -> usize {
        self.active.len().saturating_sub(1)
    }

    #[inline]
    pub fn is_open(&self, scope: ScopeId) -> bool {
        self.frames.contains_key(&scope)
    }

    pub fn name(&self, scope: ScopeId) -> Option<&str> {
        self.frames.get(&scope).and_then(|frame| frame.name.as_deref())
    }

    /// Opens a scope nested in `parent` and makes it active.
    pub fn start(&mut self, parent: ScopeId, name: Option<&str>) -> Result<ScopeId, UsageError> {
        if !self.is_open(parent) {
            return Err(UsageError::ScopeClosed(parent));
        }
        let id = ScopeId::new();
        let frame = Frame {
            parent: Some(parent),
            name: name.map(Into::into),
            tensors: vec![],
        };
        self.frames.insert(id, frame);
        self.active.push(id);
        Ok(id)
    }

    /// Records `tensor` as owned by `scope`.
    ///
    /// Tracking into the root is a no-op that returns `false`.
    pub fn track(&mut self, scope: ScopeId, tensor: TensorId) -> Result<bool, UsageError> {
        if self.owners.contains_key(&tensor) {
            return Err(UsageError::AlreadyTracked(tensor));
        }
        if scope == self.root {
            return Ok(false);
        }
        let frame = self
            .frames
            .get_mut(&scope)
            .ok_or(UsageError::ScopeClosed(scope))?;
        frame.tensors.push(tensor);
        self.owners.insert(tensor, scope);
        Ok(true)
    }

    /// Releases `tensor` from its owner, returning the owner if there was one.
    pub fn untrack(&mut self, tensor: TensorId) -> Option<ScopeId> {
        let scope = self.owners.remove(&tensor)?;
        if let Some(frame) = self.frames.get_mut(&scope) {
            frame.tensors.retain(|&id| id != tensor);
        }
        Some(scope)
    }

    #[inline]
    pub fn owner(&self, tensor: TensorId) -> Option<ScopeId> {
        self.owners.get(&tensor).copied()
    }

    /// Tensors owned by `scope`, in creation order.
    pub fn tracked(&self, scope: ScopeId) -> Option<&[TensorId]> {
        self.frames.get(&scope).map(|frame| &frame.tensors[..])
    }

    /// Number of tensors owned by any scope.
    #[inline]
    pub fn num_tracked(&self) -> usize {
        self.owners.len()
    }

    /// Closes `scope`.
    ///
    /// Tensors it owns that appear in `keep` move to the nearest open ancestor; the
    /// rest are returned, in creation order, for the caller to dispose. Scopes nested
    /// in the closed one are re-parented the same way.
    pub fn end(
        &mut self,
        scope: ScopeId,
        keep: &FxHashSet<TensorId>,
    ) -> Result<Vec<TensorId>, UsageError> {
        if scope == self.root {
            return Err(UsageError::EndRootScope);
        }
        let frame = self
            .frames
            .remove(&scope)
            .ok_or(UsageError::ScopeClosed(scope))?;
        self.active.retain(|&id| id != scope);

        let parent = self.nearest_open(frame.parent);
        for child in self.frames.values_mut() {
            if child.parent == Some(scope) {
                child.parent = Some(parent);
            }
        }

        let mut disposed = vec![];
        for tensor in frame.tensors {
            self.owners.remove(&tensor);
            if !keep.contains(&tensor) {
                disposed.push(tensor);
                continue;
            }
            if parent == self.root {
                continue;
            }
            if let Some(frame) = self.frames.get_mut(&parent) {
                frame.tensors.push(tensor);
                self.owners.insert(tensor, parent);
            }
        }
        Ok(disposed)
    }

    /// Closes every scope above the root, returning every tensor they owned.
    pub fn teardown(&mut self) -> Vec<TensorId> {
        let mut disposed = vec![];
        while let Some(&scope) = self.active.last() {
            if scope == self.root {
                break;
            }
            match self.end(scope, &FxHashSet::default()) {
                Ok(tensors) => disposed.extend(tensors),
                Err(_) => _ = self.active.pop(),
            }
        }
        // scopes that were re-parented but never on the active stack
        let rest: Vec<_> = self.owners.keys().copied().collect();
        self.owners.clear();
        self.frames.retain(|&id, _| id == self.root);
        self.active = vec![self.root];
        disposed.extend(rest);
        disposed
    }

    /// Parents always point at open frames since [`Self::end`] re-parents children.
    fn nearest_open(&self, scope: Option<ScopeId>) -> ScopeId {
        match scope {
            Some(id) if self.is_open(id) => id,
            _ => self.root,
        }
    }
}

/// A value returned from a scope. Every tensor reachable from it survives the scope.
pub trait ScopeResult {
    fn tensors(&self, output: &mut Vec<TensorId>);

    fn tensor_ids(&self) -> FxHashSet<TensorId> {
        let mut output = vec![];
        self.tensors(&mut output);
        output.into_iter().collect()
    }
}

impl ScopeResult for Tensor {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        output.push(self.id());
    }
}

impl<T: ScopeResult + ?Sized> ScopeResult for &T {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        (**self).tensors(output)
    }
}

impl<T: ScopeResult> ScopeResult for [T] {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        self.iter().for_each(|x| x.tensors(output))
    }
}

impl<T: ScopeResult> ScopeResult for Vec<T> {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        self.iter().for_each(|x| x.tensors(output))
    }
}

impl<T: ScopeResult, const N: usize> ScopeResult for [T; N] {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        self.iter().for_each(|x| x.tensors(output))
    }
}

impl<T: ScopeResult> ScopeResult for Option<T> {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        if let Some(x) = self {
            x.tensors(output)
        }
    }
}

impl<K, V: ScopeResult, S: BuildHasher> ScopeResult for HashMap<K, V, S> {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        self.values().for_each(|x| x.tensors(output))
    }
}

impl<K, V: ScopeResult> ScopeResult for BTreeMap<K, V> {
    fn tensors(&self, output: &mut Vec<TensorId>) {
        self.values().for_each(|x| x.tensors(output))
    }
}

macro_rules! impl_scope_result_none {
    ($($t:ty),*) => {
        $(
            impl ScopeResult for $t {
                #[inline]
                fn tensors(&self, _output: &mut Vec<TensorId>) {}
            }
        )*
    };
}

impl_scope_result_none!(
    (),
    bool,
    i32,
    u32,
    usize,
    f32,
    f64,
    String,
    DataBuffer,
    std::time::Duration
);

macro_rules! impl_scope_result_tuple {
    ($($name:ident),+) => {
        impl<$($name: ScopeResult),+> ScopeResult for ($($name,)+) {
            #[allow(non_snake_case)]
            fn tensors(&self, output: &mut Vec<TensorId>) {
                let ($($name,)+) = self;
                $($name.tensors(output);)+
            }
        }
    };
}

impl_scope_result_tuple!(A);
impl_scope_result_tuple!(A, B);
impl_scope_result_tuple!(A, B, C);
impl_scope_result_tuple!(A, B, C, D);

#[cfg(test)]
mod tests {
    use std::error::Error;

    use rustc_hash::FxHashSet;

    use super::{ScopeResult, ScopeStack};
    use crate::loom::{
        error::UsageError,
        num::DataType,
        tensor::{Tensor, TensorId, TensorInfo},
    };

    fn tensor() -> Tensor {
        Tensor::new(TensorInfo::new([1], DataType::F32))
    }

    #[test]
    fn test_end_disposes_unkept() -> Result<(), Box<dyn Error>> {
        let mut stack = ScopeStack::new();
        let outer = stack.start(stack.root(), None)?;
        let inner = stack.start(outer, Some("inner"))?;
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.name(inner), Some("inner"));

        let [a, b, c] = [TensorId::new(), TensorId::new(), TensorId::new()];
        for id in [a, b, c] {
            assert!(stack.track(inner, id)?);
        }

        let keep = [b].into_iter().collect();
        let disposed = stack.end(inner, &keep)?;
        assert_eq!(disposed, vec![a, c]);
        assert_eq!(stack.owner(b), Some(outer));
        assert_eq!(stack.tracked(outer), Some(&[b][..]));
        assert_eq!(stack.active(), outer);

        let disposed = stack.end(outer, &FxHashSet::default())?;
        assert_eq!(disposed, vec![b]);
        assert_eq!(stack.num_tracked(), 0);
        Ok(())
    }

    #[test]
    fn test_root_is_untracked() -> Result<(), Box<dyn Error>> {
        let mut stack = ScopeStack::new();
        let id = TensorId::new();
        assert!(!stack.track(stack.root(), id)?);
        assert_eq!(stack.owner(id), None);
        assert_eq!(stack.end(stack.root(), &FxHashSet::default()), Err(UsageError::EndRootScope));

        // a result kept out of a top-level scope is released to the root
        let scope = stack.start(stack.root(), None)?;
        stack.track(scope, id)?;
        assert_eq!(stack.track(scope, id), Err(UsageError::AlreadyTracked(id)));
        let keep = [id].into_iter().collect();
        assert!(stack.end(scope, &keep)?.is_empty());
        assert_eq!(stack.owner(id), None);
        assert_eq!(stack.end(scope, &keep), Err(UsageError::ScopeClosed(scope)));
        Ok(())
    }

    #[test]
    fn test_out_of_order_end() -> Result<(), Box<dyn Error>> {
        let mut stack = ScopeStack::new();
        let outer = stack.start(stack.root(), None)?;
        let pending = stack.start(outer, None)?;
        let later = stack.start(outer, None)?;
        assert_eq!(stack.active(), later);

        let x = TensorId::new();
        let y = TensorId::new();
        stack.track(pending, x)?;
        stack.track(later, y)?;

        // the pending scope finishes after a later one was opened
        let keep = [x].into_iter().collect();
        assert!(stack.end(pending, &keep)?.is_empty());
        assert_eq!(stack.active(), later);
        assert_eq!(stack.owner(x), Some(outer));
        assert_eq!(stack.owner(y), Some(later));

        // closing a parent before its child re-parents the child
        let child = stack.start(later, None)?;
        stack.end(later, &FxHashSet::default())?;
        let z = TensorId::new();
        stack.track(child, z)?;
        stack.end(child, &[z].into_iter().collect())?;
        assert_eq!(stack.owner(z), Some(outer));
        Ok(())
    }

    #[test]
    fn test_teardown() -> Result<(), Box<dyn Error>> {
        let mut stack = ScopeStack::new();
        let a = stack.start(stack.root(), None)?;
        let b = stack.start(a, None)?;
        let ids = [TensorId::new(), TensorId::new()];
        stack.track(a, ids[0])?;
        stack.track(b, ids[1])?;
        let mut disposed = stack.teardown();
        disposed.sort_by_key(|id| id.get());
        let mut expected = ids.to_vec();
        expected.sort_by_key(|id| id.get());
        assert_eq!(disposed, expected);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.active(), stack.root());
        Ok(())
    }

    #[test]
    fn test_collect_results() {
        let a = tensor();
        let b = tensor();
        let c = tensor();
        let mut map = std::collections::HashMap::new();
        map.insert("c", c.clone());
        let result = (a.clone(), vec![Some(b.clone()), None], map, 3.0f32);
        let ids = result.tensor_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&a.id()) && ids.contains(&b.id()) && ids.contains(&c.id()));
        assert!(().tensor_ids().is_empty());
    }
}
