use crate::catalog::{
    CatalogEntryUpdate, CatalogFile, CatalogStore, Embedding, NewCatalogEntry, StoreError,
};
use crate::semantic::embeddings::model_id_hash;
use crate::semantic::storage::CatalogStorageError;
use std::path::Path;

fn open(path: &Path) -> CatalogFile {
    CatalogFile::open(path.to_path_buf(), model_id_hash("clip-vit-b-32")).unwrap()
}

fn computed(v: &[f32]) -> Embedding {
    Embedding::Computed(v.to_vec())
}

#[test]
fn test_entries_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("db/catalog.bin");

    let store = open(&path);
    let shoe = store
        .insert(NewCatalogEntry::for_image("products/shoe.jpg", computed(&[0.6, 0.8])))
        .unwrap();
    let hat = store
        .insert(NewCatalogEntry::for_image("products/hat.jpg", Embedding::Pending))
        .unwrap();
    drop(store);

    let store = open(&path);
    let entries = store.find_all().unwrap();
    assert_eq!(entries, vec![shoe.clone(), hat.clone()]);
    assert_eq!(store.dimensions().unwrap(), Some(2));
    assert_eq!(store.find_all_with_embedding().unwrap(), vec![shoe.clone()]);
    assert_eq!(store.find_by_id(hat.id).unwrap(), Some(hat));
    assert_eq!(
        store.find_by_image_ref("products/shoe.jpg").unwrap(),
        Some(shoe)
    );
    assert_eq!(store.find_by_image_ref("products/none.jpg").unwrap(), None);
}

#[test]
fn test_duplicate_image_ref_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(&tmp.path().join("catalog.bin"));

    store
        .insert(NewCatalogEntry::for_image("products/a.jpg", Embedding::Pending))
        .unwrap();
    let result = store.insert(NewCatalogEntry::for_image("products/a.jpg", Embedding::Pending));

    assert!(matches!(result, Err(StoreError::DuplicateImageRef(r)) if r == "products/a.jpg"));
    assert_eq!(store.find_all().unwrap().len(), 1);
}

#[test]
fn test_dimension_is_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(&tmp.path().join("catalog.bin"));

    let a = store
        .insert(NewCatalogEntry::for_image("a.jpg", computed(&[1.0, 0.0, 0.0])))
        .unwrap();
    let b = store
        .insert(NewCatalogEntry::for_image("b.jpg", Embedding::Pending))
        .unwrap();

    assert!(matches!(
        store.update_embedding(b.id, vec![1.0, 0.0]),
        Err(StoreError::DimensionMismatch {
            expected: 3,
            got: 2
        })
    ));
    assert!(matches!(
        store.update_embedding(b.id, vec![]),
        Err(StoreError::EmptyEmbedding)
    ));
    assert!(matches!(
        store.insert(NewCatalogEntry::for_image("c.jpg", computed(&[1.0]))),
        Err(StoreError::DimensionMismatch { .. })
    ));

    store.update_embedding(b.id, vec![0.0, 1.0, 0.0]).unwrap();
    assert_eq!(store.find_all_with_embedding().unwrap().len(), 2);
    assert_eq!(
        store.find_by_id(a.id).unwrap().unwrap().embedding,
        computed(&[1.0, 0.0, 0.0])
    );
}

#[test]
fn test_update_details_and_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.bin");
    let store = open(&path);

    let entry = store
        .insert(NewCatalogEntry::for_image("products/red_shoe.jpg", Embedding::Pending))
        .unwrap();

    let updated = store
        .update_details(
            entry.id,
            CatalogEntryUpdate {
                name: None,
                category: Some("Footwear".to_string()),
            },
        )
        .unwrap();
    assert_eq!(updated.name, "red shoe");
    assert_eq!(updated.category, "Footwear");

    store.delete_by_id(entry.id).unwrap();
    assert!(matches!(
        store.delete_by_id(entry.id),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.update_details(entry.id, CatalogEntryUpdate::default()),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.update_embedding(entry.id, vec![1.0]),
        Err(StoreError::NotFound(_))
    ));
    assert!(open(&path).find_all().unwrap().is_empty());
}

#[test]
fn test_ids_are_never_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.bin");

    let store = open(&path);
    let first = store
        .insert(NewCatalogEntry::for_image("a.jpg", Embedding::Pending))
        .unwrap();
    store.delete_by_id(first.id).unwrap();
    drop(store);

    let store = open(&path);
    let second = store
        .insert(NewCatalogEntry::for_image("a.jpg", Embedding::Pending))
        .unwrap();
    assert!(second.id > first.id);
}

#[test]
fn test_model_change_resets_embeddings() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.bin");

    let store = open(&path);
    store
        .insert(NewCatalogEntry::for_image("a.jpg", computed(&[1.0, 0.0])))
        .unwrap();
    drop(store);

    let store = CatalogFile::open(path.clone(), model_id_hash("resnet50")).unwrap();
    let entries = store.find_all().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].embedding, Embedding::Pending);
    assert_eq!(store.dimensions().unwrap(), None);

    // other dimensions are accepted after the reset
    store.update_embedding(entries[0].id, vec![0.0, 0.0, 1.0]).unwrap();
    drop(store);

    let store = CatalogFile::open(path, model_id_hash("resnet50")).unwrap();
    assert_eq!(store.dimensions().unwrap(), Some(3));
}

#[test]
fn test_corrupt_file_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.bin");
    std::fs::write(&path, b"garbage").unwrap();

    let result = CatalogFile::open(path, model_id_hash("clip-vit-b-32"));

    assert!(matches!(
        result,
        Err(StoreError::Storage(
            CatalogStorageError::InvalidFormat(_) | CatalogStorageError::ChecksumMismatch
        ))
    ));
}

#[test]
fn test_read_only_open_never_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("catalog.bin");

    let missing = CatalogFile::open_read_only(path.clone(), model_id_hash("clip-vit-b-32")).unwrap();
    assert!(missing.find_all().unwrap().is_empty());
    assert!(!path.exists());

    let store = open(&path);
    store
        .insert(NewCatalogEntry::for_image("a.jpg", computed(&[1.0, 0.0])))
        .unwrap();
    drop(store);
    let bytes = std::fs::read(&path).unwrap();

    // a different model resets embeddings in memory only
    let reader = CatalogFile::open_read_only(path.clone(), model_id_hash("resnet50")).unwrap();
    assert_eq!(reader.find_all().unwrap()[0].embedding, Embedding::Pending);
    assert!(matches!(
        reader.insert(NewCatalogEntry::for_image("b.jpg", Embedding::Pending)),
        Err(StoreError::ReadOnly)
    ));
    assert!(matches!(
        reader.delete_by_id(1),
        Err(StoreError::ReadOnly)
    ));
    assert_eq!(std::fs::read(&path).unwrap(), bytes);
}
