//! End-to-end resolution of a small product catalogue, the way a GraphQL
//! resolver tree would drive it. Each resolver only knows how to load its
//! own data; the tests check that the store sees one query per level
//! instead of one per object.

use batchsync::{Batch, Deferred, Error, Executor, ExecutorScope, KeyedEntry, Loader, OnDuplicate, Result};
use std::cell::RefCell;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Model {
    Product,
    Variant,
    Image,
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    model: Model,
    id: u32,
    title: String,
    parent_id: Option<u32>,
}

impl KeyedEntry<u32> for Record {
    fn get_key(&self) -> &u32 {
        &self.id
    }
}

thread_local! {
    static QUERIES: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

fn queries() -> Vec<String> {
    QUERIES.with(|queries| queries.borrow().clone())
}

/// Products 1..=3 exist. Product `p` has variants `10p + 1` and `10p + 2`;
/// every product and variant `n` has image `100 + n`.
fn table(model: Model) -> Vec<Record> {
    let record = |id: u32, parent_id: Option<u32>| Record {
        model,
        id,
        title: format!("{:?} {}", model, id),
        parent_id,
    };

    match model {
        Model::Product => (1..=3).map(|id| record(id, None)).collect(),
        Model::Variant => (1..=3)
            .flat_map(|product| vec![10 * product + 1, 10 * product + 2].into_iter().map(move |id| (id, product)))
            .map(|(id, product)| record(id, Some(product)))
            .collect(),
        Model::Image => (1..=3)
            .chain((1..=3).flat_map(|product| vec![10 * product + 1, 10 * product + 2]))
            .map(|owner| record(100 + owner, Some(owner)))
            .collect(),
    }
}

fn select(model: Model, column: &str, ids: &[u32]) -> Vec<Record> {
    QUERIES.with(|queries| {
        queries
            .borrow_mut()
            .push(format!("{:?} where {} in {:?}", model, column, ids))
    });

    table(model)
        .into_iter()
        .filter(|record| match column {
            "id" => ids.contains(&record.id),
            _ => record.parent_id.map_or(false, |parent| ids.contains(&parent)),
        })
        .collect()
}

/// Loads records of one model by id.
struct RecordLoader {
    model: Model,
}

impl Loader for RecordLoader {
    type Args = Model;
    type Key = u32;
    type Value = Record;

    fn new(model: Model) -> Self {
        RecordLoader { model }
    }

    fn perform(&self, batch: &Batch<'_, Self>) -> Result<()> {
        let ids: Vec<u32> = batch.keys().keys().copied().collect();
        let records = select(self.model, "id", &ids);

        for id in batch.fulfill_from_iter(OnDuplicate::Error, records)? {
            batch.reject(&id, Error::msg(format!("{:?} {} not found", self.model, id)))?;
        }
        Ok(())
    }
}

/// Loads the records of `child` model belonging to each parent id.
struct AssociationLoader {
    child: Model,
}

impl Loader for AssociationLoader {
    // (owner model, child model)
    type Args = (Model, Model);
    type Key = u32;
    type Value = Vec<Record>;

    fn new((_owner, child): (Model, Model)) -> Self {
        AssociationLoader { child }
    }

    fn perform(&self, batch: &Batch<'_, Self>) -> Result<()> {
        let ids: Vec<u32> = batch.keys().keys().copied().collect();
        let children = select(self.child, "parent_id", &ids);

        batch.fulfill_with(|id| {
            children
                .iter()
                .filter(|child| child.parent_id == Some(*id))
                .cloned()
                .collect()
        })
    }
}

fn request() -> ExecutorScope {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    QUERIES.with(|queries| queries.borrow_mut().clear());
    Executor::new().enter()
}

fn product(id: u32) -> Deferred<Record> {
    RecordLoader::for_args(Model::Product).unwrap().load(id)
}

fn variants(product_id: u32) -> Deferred<Vec<Record>> {
    AssociationLoader::for_args((Model::Product, Model::Variant))
        .unwrap()
        .load(product_id)
}

fn images(owner_id: u32) -> Deferred<Vec<Record>> {
    AssociationLoader::for_args((Model::Variant, Model::Image))
        .unwrap()
        .load(owner_id)
}

/// The product's own image, followed by every variant's images.
fn product_images(product: &Record) -> Deferred<Vec<String>> {
    let own_image = RecordLoader::for_args(Model::Image)
        .unwrap()
        .load(100 + product.id);

    let variant_images = variants(product.id).and_then(|variants| {
        Deferred::all(variants.iter().map(|variant| images(variant.id)))
            .then(|images| Ok(images.concat()))
    });

    Deferred::all(vec![own_image.then(|image| Ok(vec![image])), variant_images]).then(
        |groups| {
            Ok(groups
                .concat()
                .into_iter()
                .map(|image| image.title)
                .collect())
        },
    )
}

#[test]
fn test_product_variants_count() {
    let _scope = request();

    let counts = Deferred::all((1..=3).map(|id| {
        product(id).and_then(|product| variants(product.id).then(|variants| Ok(variants.len())))
    }));

    assert_eq!(counts.sync().unwrap(), [2, 2, 2]);
    assert_eq!(
        queries(),
        [
            "Product where id in [1, 2, 3]",
            "Variant where parent_id in [1, 2, 3]",
        ]
    );
}

#[test]
fn test_nested_images() {
    let _scope = request();

    let all_images = Deferred::all(
        (1..=2).map(|id| product(id).and_then(|product| product_images(&product))),
    );

    let result = all_images.sync().unwrap();
    assert_eq!(
        result,
        [
            vec!["Image 101", "Image 111", "Image 112"],
            vec!["Image 102", "Image 121", "Image 122"],
        ]
    );

    // One query per level, however many products there are.
    assert_eq!(
        queries(),
        [
            "Product where id in [1, 2]",
            "Image where id in [101, 102]",
            "Variant where parent_id in [1, 2]",
            "Image where parent_id in [11, 12, 21, 22]",
        ]
    );
}

#[test]
fn test_shared_record_is_fetched_once() {
    let _scope = request();

    let by_product = product(2);
    let by_variant = RecordLoader::for_args(Model::Variant)
        .unwrap()
        .load(21)
        .and_then(|variant| product(variant.parent_id.unwrap_or_default()));

    assert_eq!(by_variant.sync().unwrap(), by_product.sync().unwrap());
    assert_eq!(
        queries(),
        [
            "Product where id in [2]",
            "Variant where id in [21]",
        ]
    );
}

#[test]
fn test_missing_record_rejects_only_that_key() {
    let _scope = request();

    let found = product(1);
    let missing = product(42);

    assert_eq!(missing.sync().unwrap_err().to_string(), "Product 42 not found");
    assert_eq!(found.sync().unwrap().title, "Product 1");
    assert_eq!(queries(), ["Product where id in [1, 42]"]);
}

#[test]
fn test_load_execution_error() {
    let _scope = request();

    let value: Deferred<String> =
        product(1).then(|_| Err(Error::msg("test error message")));

    assert_eq!(value.sync().unwrap_err().to_string(), "test error message");
}

#[test]
fn test_independent_requests_do_not_share_cache() {
    {
        let _scope = request();
        product(1).sync().unwrap();
    }

    let _scope = request();
    product(1).sync().unwrap();
    assert_eq!(queries(), ["Product where id in [1]"]);
}
