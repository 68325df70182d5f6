#![allow(dead_code)]

use std::collections::HashSet;

use cadclean_core::document::{
    Definition, DefinitionId, DictionaryKey, Document, Entity, EntityId, ExternalResource, Layer,
    ResourceId,
};
use cadclean_core::errors::DocumentError;
use cadclean_core::geometry::Bounds2D;
use cadclean_core::graph::SceneGraph;

/// 包装 `Document`，按需注入失败。
#[derive(Debug, Default)]
pub struct FlakyGraph {
    pub inner: Document,
    pub fail_erase: HashSet<EntityId>,
    pub fail_append: bool,
    pub fail_bind: bool,
    pub fail_resource_erase: HashSet<ResourceId>,
}

impl FlakyGraph {
    pub fn new(inner: Document) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }
}

impl SceneGraph for FlakyGraph {
    type Checkpoint = Document;

    fn checkpoint(&self) -> Self::Checkpoint {
        self.inner.checkpoint()
    }

    fn rollback(&mut self, checkpoint: Self::Checkpoint) {
        self.inner.rollback(checkpoint);
    }

    fn model_space(&self) -> DefinitionId {
        self.inner.model_space()
    }

    fn definition_ids(&self) -> Vec<DefinitionId> {
        self.inner.definition_ids()
    }

    fn definition(&self, id: DefinitionId) -> Option<&Definition> {
        self.inner.definition(id)
    }

    fn find_definitions(&self, name: &str) -> Vec<DefinitionId> {
        self.inner.find_definitions(name)
    }

    fn entity_ids(&self, container: DefinitionId) -> Vec<EntityId> {
        self.inner.entity_ids(container)
    }

    fn entity(&self, id: EntityId) -> Option<&Entity> {
        SceneGraph::entity(&self.inner, id)
    }

    fn owner(&self, id: EntityId) -> Option<DefinitionId> {
        self.inner.owner(id)
    }

    fn is_erased(&self, id: EntityId) -> bool {
        SceneGraph::is_erased(&self.inner, id)
    }

    fn layer(&self, name: &str) -> Option<&Layer> {
        self.inner.layer(name)
    }

    fn set_layer_locked(&mut self, name: &str, locked: bool) -> Result<(), DocumentError> {
        self.inner.set_layer_locked(name, locked)
    }

    fn bounding_box(&self, id: EntityId) -> Option<Bounds2D> {
        self.inner.bounding_box(id)
    }

    fn can_explode(&self, id: EntityId) -> bool {
        self.inner.can_explode(id)
    }

    fn explode(&self, id: EntityId) -> Result<Vec<Entity>, DocumentError> {
        self.inner.explode(id)
    }

    fn append_entity(
        &mut self,
        container: DefinitionId,
        entity: Entity,
    ) -> Result<EntityId, DocumentError> {
        if self.fail_append {
            return Err(DocumentError::DefinitionNotFound(container.get()));
        }
        self.inner.append_entity(container, entity)
    }

    fn erase(&mut self, id: EntityId) -> Result<(), DocumentError> {
        if self.fail_erase.contains(&id) {
            return Err(DocumentError::LayerLocked("injected".to_string()));
        }
        self.inner.erase(id)
    }

    fn references_to(&self, definition: DefinitionId) -> Vec<EntityId> {
        self.inner.references_to(definition)
    }

    fn detach_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError> {
        self.inner.detach_definition(definition)
    }

    fn erase_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError> {
        self.inner.erase_definition(definition)
    }

    fn bind_external_definitions(&mut self) -> Result<Vec<DefinitionId>, DocumentError> {
        if self.fail_bind {
            // 先改动文档再失败，检验调用方的回滚。
            let model = self.inner.model_space();
            let first = self.inner.entity_ids(model).first().copied();
            if let Some(first) = first {
                let _ = self.inner.erase(first);
            }
            return Err(DocumentError::DefinitionNotFound(u64::MAX));
        }
        self.inner.bind_external_definitions()
    }

    fn resource_ids(&self) -> Vec<ResourceId> {
        self.inner.resource_ids()
    }

    fn resource(&self, id: ResourceId) -> Option<&ExternalResource> {
        self.inner.resource(id)
    }

    fn resource_references(&self, id: ResourceId) -> Vec<EntityId> {
        self.inner.resource_references(id)
    }

    fn dictionary_entries(&self, id: ResourceId) -> Vec<DictionaryKey> {
        self.inner.dictionary_entries(id)
    }

    fn remove_dictionary_entry(&mut self, key: &DictionaryKey) -> Result<(), DocumentError> {
        self.inner.remove_dictionary_entry(key)
    }

    fn erase_resource(&mut self, id: ResourceId) -> Result<(), DocumentError> {
        if self.fail_resource_erase.contains(&id) {
            return Err(DocumentError::ResourceNotFound(id.get()));
        }
        self.inner.erase_resource(id)
    }
}
