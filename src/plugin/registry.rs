//! Resource class registry

use crate::error::{Error, Result};
use crate::metamodel::{builtin, Relation, ResourceClass, Subscription};
use crate::store::ClassId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registered resource classes and their resolved subscriptions
#[derive(Debug, Default, Clone)]
pub struct ClassRegistry {
    classes: HashMap<ClassId, Arc<ResourceClass>>,
    by_name: HashMap<(String, String), ClassId>,
    subscriptions: HashMap<ClassId, Vec<Arc<Subscription>>>,
    all_subscriptions: Vec<Arc<Subscription>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, class: ResourceClass) -> Arc<ResourceClass> {
        let class = Arc::new(class);
        self.by_name
            .insert((class.module.clone(), class.name.clone()), class.id);
        self.classes.insert(class.id, class.clone());
        class
    }

    pub(crate) fn remove_module(&mut self, module: &str) {
        self.classes.retain(|_, c| c.module != module);
        self.by_name.retain(|(m, _), _| m != module);
    }

    pub fn get(&self, id: ClassId) -> Option<&Arc<ResourceClass>> {
        self.classes.get(&id)
    }

    pub fn lookup(&self, module: &str, name: &str) -> Option<&Arc<ResourceClass>> {
        self.by_name
            .get(&(module.to_string(), name.to_string()))
            .and_then(|id| self.classes.get(id))
    }

    /// Resolve `"Class"` (same module, then builtin) or `"module.Class"`
    pub fn resolve(&self, module: &str, name: &str) -> Option<&Arc<ResourceClass>> {
        match name.split_once('.') {
            Some((m, n)) => self.lookup(m, n),
            None => self
                .lookup(module, name)
                .or_else(|| self.lookup(builtin::BUILTIN_MODULE, name)),
        }
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ResourceClass>> {
        self.classes.values()
    }

    pub fn module_classes<'a>(
        &'a self,
        module: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ResourceClass>> + 'a {
        self.classes.values().filter(move |c| c.module == module)
    }

    /// Subscriptions held by instances of a class
    pub fn subscriptions_of(&self, class: ClassId) -> &[Arc<Subscription>] {
        self.subscriptions
            .get(&class)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_subscriptions(&self) -> &[Arc<Subscription>] {
        &self.all_subscriptions
    }

    /// Check every relation target of a module resolves
    pub(crate) fn check_relations(&self, module: &str) -> Result<()> {
        for class in self.module_classes(module) {
            for relation in &class.relations {
                let target = self.resolve(module, relation.target()).ok_or_else(|| {
                    Error::ResourceProgramming {
                        class_name: class.name.clone(),
                        message: format!("unknown relation target '{}'", relation.target()),
                    }
                })?;
                if let Some(missing) = relation
                    .attributes()
                    .iter()
                    .find(|a| !target.has_attribute(a))
                {
                    return Err(Error::ResourceProgramming {
                        class_name: class.name.clone(),
                        message: format!(
                            "relation attribute '{}' not on {}",
                            missing,
                            target.qualified_name()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve every declared relation into subscriptions.
    ///
    /// `Subscribe` attaches to the declaring class. `Provide` is inverted
    /// into a subscription to the declaring class, attached to the target
    /// and every subclass of it that has all the named attributes.
    pub(crate) fn resolve_subscriptions(&mut self) {
        let mut subscriptions: HashMap<ClassId, Vec<Arc<Subscription>>> = HashMap::new();
        let mut all: Vec<Arc<Subscription>> = Vec::new();

        let mut attach = |class: ClassId, sub: &Arc<Subscription>| {
            let list = subscriptions.entry(class).or_default();
            if !list.iter().any(|s| s.key == sub.key) {
                list.push(sub.clone());
            }
        };

        let mut declared: Vec<&Arc<ResourceClass>> = self.classes.values().collect();
        declared.sort_by_key(|c| c.id);

        for class in declared {
            for relation in &class.relations {
                let Some(target) = self.resolve(&class.module, relation.target()) else {
                    continue;
                };
                match relation {
                    Relation::Subscribe {
                        attributes,
                        ignorecase,
                        ..
                    } => {
                        let sub = Arc::new(Subscription::new(
                            target.qualified_name(),
                            attributes.clone(),
                            *ignorecase,
                        ));
                        attach(class.id, &sub);
                        if !all.iter().any(|s| s.key == sub.key) {
                            all.push(sub);
                        }
                    }
                    Relation::Provide {
                        attributes,
                        ignorecase,
                        ..
                    } => {
                        let sub = Arc::new(Subscription::new(
                            class.qualified_name(),
                            attributes.clone(),
                            *ignorecase,
                        ));
                        for candidate in self.classes.values() {
                            if candidate.is_a(target.qualified_name())
                                && attributes.iter().all(|a| candidate.has_attribute(a))
                            {
                                debug!(
                                    subscriber = candidate.qualified_name(),
                                    key = %sub.key,
                                    "Attached inverted subscription"
                                );
                                attach(candidate.id, &sub);
                            }
                        }
                        if !all.iter().any(|s| s.key == sub.key) {
                            all.push(sub);
                        }
                    }
                }
            }
        }

        self.subscriptions = subscriptions;
        self.all_subscriptions = all;
    }
}
