//! 清理引擎与图形数据库之间的协作契约。
//!
//! 引擎中的算法只依赖 [`SceneGraph`]，数据库的事务、打开模式与坐标变换都由实现方负责。
//! [`Document`] 是内存实现，检查点即整份文档的克隆。

use std::collections::BTreeMap;

use tracing::debug;

use crate::document::{
    Definition, DefinitionId, DictionaryKey, Document, Entity, EntityId, ExternalResource, Layer,
    ResourceId,
};
use crate::errors::DocumentError;
use crate::geometry::Bounds2D;

pub trait SceneGraph {
    type Checkpoint;

    /// 记录当前状态，作为阶段事务的起点。
    fn checkpoint(&self) -> Self::Checkpoint;
    /// 放弃检查点之后的全部修改。
    fn rollback(&mut self, checkpoint: Self::Checkpoint);

    fn model_space(&self) -> DefinitionId;
    fn definition_ids(&self) -> Vec<DefinitionId>;
    fn definition(&self, id: DefinitionId) -> Option<&Definition>;
    /// 按名称（不区分大小写）查找块定义，可能有多个结果。
    fn find_definitions(&self, name: &str) -> Vec<DefinitionId>;

    /// 容器内未删除的实体，按插入顺序。
    fn entity_ids(&self, container: DefinitionId) -> Vec<EntityId>;
    fn entity(&self, id: EntityId) -> Option<&Entity>;
    fn owner(&self, id: EntityId) -> Option<DefinitionId>;
    fn is_erased(&self, id: EntityId) -> bool;
    fn layer(&self, name: &str) -> Option<&Layer>;
    fn set_layer_locked(&mut self, name: &str, locked: bool) -> Result<(), DocumentError>;

    /// 世界坐标范围；无法计算时返回 `None`，调用方应跳过而非报错。
    fn bounding_box(&self, id: EntityId) -> Option<Bounds2D>;
    fn can_explode(&self, id: EntityId) -> bool;
    /// 返回块参照展开后的图元副本，不修改数据库。
    fn explode(&self, id: EntityId) -> Result<Vec<Entity>, DocumentError>;
    fn append_entity(
        &mut self,
        container: DefinitionId,
        entity: Entity,
    ) -> Result<EntityId, DocumentError>;
    fn erase(&mut self, id: EntityId) -> Result<(), DocumentError>;

    /// 指向该定义的全部未删除块参照（任意容器内）。
    fn references_to(&self, definition: DefinitionId) -> Vec<EntityId>;
    /// 拆离外部参照；仍有参照时失败。
    fn detach_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError>;
    /// 删除本地块定义；仍有参照时失败。
    fn erase_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError>;
    /// 将已加载的外部参照绑定为本地块，返回新建的块定义。
    fn bind_external_definitions(&mut self) -> Result<Vec<DefinitionId>, DocumentError>;

    fn resource_ids(&self) -> Vec<ResourceId>;
    fn resource(&self, id: ResourceId) -> Option<&ExternalResource>;
    /// 引用该资源的未删除实体（任意容器内）。
    fn resource_references(&self, id: ResourceId) -> Vec<EntityId>;
    fn dictionary_entries(&self, id: ResourceId) -> Vec<DictionaryKey>;
    fn remove_dictionary_entry(&mut self, key: &DictionaryKey) -> Result<(), DocumentError>;
    /// 删除资源定义对象；仍被引用或已删除时失败。
    fn erase_resource(&mut self, id: ResourceId) -> Result<(), DocumentError>;
}

impl SceneGraph for Document {
    type Checkpoint = Document;

    fn checkpoint(&self) -> Self::Checkpoint {
        self.clone()
    }

    fn rollback(&mut self, checkpoint: Self::Checkpoint) {
        *self = checkpoint;
    }

    fn model_space(&self) -> DefinitionId {
        self.model_space_id()
    }

    fn definition_ids(&self) -> Vec<DefinitionId> {
        self.definitions().map(|definition| definition.id).collect()
    }

    fn definition(&self, id: DefinitionId) -> Option<&Definition> {
        self.definition_by_id(id)
    }

    fn find_definitions(&self, name: &str) -> Vec<DefinitionId> {
        self.definitions()
            .filter(|definition| definition.name.eq_ignore_ascii_case(name))
            .map(|definition| definition.id)
            .collect()
    }

    fn entity_ids(&self, container: DefinitionId) -> Vec<EntityId> {
        self.entities_in(container).map(|(id, _)| id).collect()
    }

    fn entity(&self, id: EntityId) -> Option<&Entity> {
        Document::entity(self, id)
    }

    fn owner(&self, id: EntityId) -> Option<DefinitionId> {
        self.record(id).map(|record| record.owner)
    }

    fn is_erased(&self, id: EntityId) -> bool {
        self.record(id).is_none_or(|record| record.is_erased)
    }

    fn layer(&self, name: &str) -> Option<&Layer> {
        self.layer_ref(name)
    }

    fn set_layer_locked(&mut self, name: &str, locked: bool) -> Result<(), DocumentError> {
        let layer = self
            .layer_mut(name)
            .ok_or_else(|| DocumentError::LayerNotFound(name.to_string()))?;
        layer.is_locked = locked;
        Ok(())
    }

    fn bounding_box(&self, id: EntityId) -> Option<Bounds2D> {
        self.entity_bounds(id)
    }

    fn can_explode(&self, id: EntityId) -> bool {
        let Some(Entity::BlockReference(reference)) = Document::entity(self, id) else {
            return false;
        };
        let Some(definition) = self.definition_by_id(reference.definition) else {
            return false;
        };
        if definition.is_external || definition.is_layout {
            return false;
        }
        let transform = reference.transform(definition.base_point);
        self.entities_in(definition.id)
            .all(|(_, child)| child.transformed(&transform).is_some())
    }

    fn explode(&self, id: EntityId) -> Result<Vec<Entity>, DocumentError> {
        let entity =
            Document::entity(self, id).ok_or(DocumentError::EntityNotFound(id.get()))?;
        let Entity::BlockReference(reference) = entity else {
            return Err(DocumentError::NotExplodable(id.get()));
        };
        let definition = self
            .definition_by_id(reference.definition)
            .ok_or(DocumentError::DefinitionNotFound(reference.definition.get()))?;
        if definition.is_external || definition.is_layout {
            return Err(DocumentError::NotExplodable(id.get()));
        }
        let transform = reference.transform(definition.base_point);
        let mut pieces = Vec::new();
        for (_, child) in self.entities_in(definition.id) {
            let piece = child
                .transformed(&transform)
                .ok_or(DocumentError::NotExplodable(id.get()))?;
            pieces.push(piece);
        }
        // 参照上的属性值展开为属性定义，保留标签供图框识别使用。
        for attribute in &reference.attributes {
            pieces.push(Entity::AttributeDefinition(
                crate::document::AttributeDefinition {
                    tag: attribute.tag.clone(),
                    prompt: None,
                    default_text: attribute.text.clone(),
                    insert: attribute.insert,
                    height: attribute.height,
                    layer: attribute.layer.clone(),
                },
            ));
        }
        Ok(pieces)
    }

    fn append_entity(
        &mut self,
        container: DefinitionId,
        entity: Entity,
    ) -> Result<EntityId, DocumentError> {
        self.add_entity_to(container, entity)
    }

    fn erase(&mut self, id: EntityId) -> Result<(), DocumentError> {
        let layer_name = {
            let record = self
                .record(id)
                .ok_or(DocumentError::EntityNotFound(id.get()))?;
            if record.is_erased {
                return Err(DocumentError::EntityErased(id.get()));
            }
            record.entity.layer_name().to_string()
        };
        if self.layer_ref(&layer_name).is_some_and(|layer| layer.is_locked) {
            return Err(DocumentError::LayerLocked(layer_name));
        }
        if let Some(record) = self.record_mut(id) {
            record.is_erased = true;
        }
        Ok(())
    }

    fn references_to(&self, definition: DefinitionId) -> Vec<EntityId> {
        self.live_records()
            .filter(|record| {
                matches!(&record.entity, Entity::BlockReference(reference) if reference.definition == definition)
            })
            .filter(|record| self.definition_by_id(record.owner).is_some())
            .map(|record| record.id)
            .collect()
    }

    fn detach_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError> {
        let target = self
            .definition_by_id(definition)
            .ok_or(DocumentError::DefinitionNotFound(definition.get()))?;
        if !target.is_external {
            return Err(DocumentError::NotExternal(definition.get()));
        }
        self.remove_unreferenced(definition)
    }

    fn erase_definition(&mut self, definition: DefinitionId) -> Result<(), DocumentError> {
        let target = self
            .definition_by_id(definition)
            .ok_or(DocumentError::DefinitionNotFound(definition.get()))?;
        if target.is_layout {
            return Err(DocumentError::LayoutDefinition(definition.get()));
        }
        self.remove_unreferenced(definition)
    }

    fn bind_external_definitions(&mut self) -> Result<Vec<DefinitionId>, DocumentError> {
        let externals: Vec<(DefinitionId, String)> = self
            .definitions()
            .filter(|definition| definition.is_external && definition.is_resolved)
            .map(|definition| (definition.id, definition.name.clone()))
            .collect();

        let mut created = Vec::new();
        for (xref_id, xref_name) in externals {
            // 依赖块以 `XREF|NAME` 命名，绑定后改为 `XREF$0$NAME`。
            let prefix = format!("{xref_name}|");
            let mut mapping: BTreeMap<DefinitionId, (DefinitionId, String)> = BTreeMap::new();
            let dependents: Vec<(DefinitionId, String)> = self
                .definitions()
                .filter(|definition| !definition.is_external)
                .filter_map(|definition| {
                    let head = definition.name.get(..prefix.len())?;
                    let tail = definition.name.get(prefix.len()..)?;
                    if !head.eq_ignore_ascii_case(&prefix) || tail.is_empty() {
                        return None;
                    }
                    Some((definition.id, format!("{xref_name}$0${tail}")))
                })
                .collect();
            for (old, name) in std::iter::once((xref_id, xref_name.clone())).chain(dependents) {
                let base_point = self
                    .definition_by_id(old)
                    .map(|definition| definition.base_point)
                    .ok_or(DocumentError::DefinitionNotFound(old.get()))?;
                let new = self.insert_local_definition(name.clone(), base_point);
                mapping.insert(old, (new, name));
            }

            for (old, (new, _)) in &mapping {
                let children: Vec<Entity> = self
                    .entities_in(*old)
                    .map(|(_, entity)| remap_reference(entity.clone(), &mapping))
                    .collect();
                for child in children {
                    self.add_entity_to(*new, child)?;
                }
            }

            for record in self.live_records_mut() {
                if let Entity::BlockReference(reference) = &mut record.entity {
                    if let Some((new, _)) = mapping.get(&reference.definition) {
                        reference.definition = *new;
                    }
                }
            }

            for old in mapping.keys() {
                self.drop_definition(*old);
            }
            debug!(xref = %xref_name, definitions = mapping.len(), "外部参照已绑定");
            created.extend(mapping.values().map(|(new, _)| *new));
        }
        Ok(created)
    }

    fn resource_ids(&self) -> Vec<ResourceId> {
        self.resources().map(|resource| resource.id).collect()
    }

    fn resource(&self, id: ResourceId) -> Option<&ExternalResource> {
        self.resource_ref(id).filter(|resource| !resource.is_erased)
    }

    fn resource_references(&self, id: ResourceId) -> Vec<EntityId> {
        self.live_records()
            .filter(|record| record.entity.resource() == Some(id))
            .filter(|record| self.definition_by_id(record.owner).is_some())
            .map(|record| record.id)
            .collect()
    }

    fn dictionary_entries(&self, id: ResourceId) -> Vec<DictionaryKey> {
        self.dictionaries()
            .iter()
            .flat_map(|(dictionary, entries)| {
                entries
                    .iter()
                    .filter(move |(_, resource)| **resource == id)
                    .map(move |(entry, _)| DictionaryKey {
                        dictionary: dictionary.clone(),
                        entry: entry.clone(),
                    })
            })
            .collect()
    }

    fn remove_dictionary_entry(&mut self, key: &DictionaryKey) -> Result<(), DocumentError> {
        let missing = || DocumentError::DictionaryEntryNotFound {
            dictionary: key.dictionary.clone(),
            entry: key.entry.clone(),
        };
        let dictionary = self
            .dictionaries_mut()
            .get_mut(&key.dictionary)
            .ok_or_else(missing)?;
        dictionary.remove(&key.entry).ok_or_else(missing)?;
        Ok(())
    }

    fn erase_resource(&mut self, id: ResourceId) -> Result<(), DocumentError> {
        let resource = self
            .resource_ref(id)
            .ok_or(DocumentError::ResourceNotFound(id.get()))?;
        if resource.is_erased {
            return Err(DocumentError::ResourceErased(id.get()));
        }
        let references = self.resource_references(id).len();
        if references > 0 {
            return Err(DocumentError::ResourceInUse {
                id: id.get(),
                references,
            });
        }
        if let Some(resource) = self.resource_mut(id) {
            resource.is_erased = true;
        }
        Ok(())
    }
}

impl Document {
    fn remove_unreferenced(&mut self, definition: DefinitionId) -> Result<(), DocumentError> {
        let references = self.references_to(definition).len();
        if references > 0 {
            return Err(DocumentError::DefinitionInUse {
                id: definition.get(),
                references,
            });
        }
        self.drop_definition(definition);
        Ok(())
    }

    /// 移除块记录并将其子实体标记为已删除。
    fn drop_definition(&mut self, definition: DefinitionId) {
        if let Some(removed) = self.remove_definition(definition) {
            for child in removed.entities {
                if let Some(record) = self.record_mut(child) {
                    record.is_erased = true;
                }
            }
        }
    }
}

fn remap_reference(
    mut entity: Entity,
    mapping: &BTreeMap<DefinitionId, (DefinitionId, String)>,
) -> Entity {
    if let Entity::BlockReference(reference) = &mut entity {
        if let Some((new, _)) = mapping.get(&reference.definition) {
            reference.definition = *new;
        }
    }
    entity
}
