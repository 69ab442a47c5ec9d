mod component;
mod db;
mod error;
mod storage;
mod view;

pub use component::{
    Component, ComponentId, ComponentTypeId, ComponentTypeInfo, ComponentTypes, DELETED_TAG_TYPE_ID, DeletedTag,
    EntityId, MAX_TYPE_ID,
};
pub use db::EntityComponentDb;
pub use error::EcsError;
pub use storage::{ErasedStorage, SlotKey, Storage, StoredComponent};
pub use view::{EntityComponentState, EntityComponentStateRef};
