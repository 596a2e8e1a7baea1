//! Employee demo: provisions an encrypted collection on the in-memory
//! engine, seeds it and runs encrypted searches.

use anyhow::{Context, Result};
use fieldcrypt::prelude::*;
use fieldcrypt_key_file::FileMasterKeySource;
use serde_json::{json, Value};
use tracing::info;

/// Collection used by the demo.
pub const EMPLOYEES: &str = "employees";

/// Upper bound of the salary range index.
pub const MAX_SALARY: i64 = 10_000_000;

const SEED: [(&str, &str, &str, i64); 10] = [
    ("Alice Johnson", "Software Engineer", "Engineering", 50_000),
    ("Bob Smith", "Product Manager", "Product", 70_000),
    ("Charlie Brown", "Data Analyst", "Engineering", 90_000),
    ("Diana Prince", "Project Manager", "Product", 110_000),
    ("Edward Stark", "DevOps Engineer", "Engineering", 130_000),
    ("Fiona Gallagher", "HR Specialist", "HR", 150_000),
    ("George Orwell", "Security Analyst", "Engineering", 170_000),
    ("Hannah Montana", "Marketing Coordinator", "Marketing", 190_000),
    ("Isaac Newton", "Chief Scientist", "Engineering", 210_000),
    ("Julia Roberts", "Finance Manager", "Finance", 250_000),
];

/// `name` and `ssn` searchable by equality, `salary` by range.
pub fn employee_schema() -> Result<FieldEncryptionSchema> {
    Ok(FieldEncryptionSchema::new(
        EMPLOYEES,
        vec![
            FieldSpec::equality("name", PlaintextType::String),
            FieldSpec::equality("ssn", PlaintextType::String),
            FieldSpec::range("salary", PlaintextType::Long, 0, MAX_SALARY, 1),
        ],
    )?)
}

fn seed_documents() -> Vec<Document> {
    SEED.iter()
        .enumerate()
        .filter_map(|(i, (name, position, department, salary))| {
            json!({
                "name": name,
                "ssn": format!("{:03}-{:02}-{:04}", 100 + i, 10 + i, 1000 + i * 111),
                "position": position,
                "department": department,
                "company": "MongoDB",
                "salary": salary,
            })
            .as_object()
            .cloned()
        })
        .collect()
}

fn summary(doc: &Document) -> String {
    let field = |key: &str| doc.get(key).map_or_else(String::new, Value::to_string);
    format!("{} | {} | {} | {}", field("name"), field("department"), field("position"), field("salary"))
}

fn report(title: &str, docs: &[Document]) {
    println!("\n{title}: {} match(es)", docs.len());
    for doc in docs {
        println!("  {}", summary(doc));
    }
}

/// Runs the demo end to end.
///
/// # Errors
///
/// Fails if the master key cannot be loaded or any encrypted operation
/// fails.
pub fn run(config: &EncryptionConfig) -> Result<()> {
    let engine = Arc::new(MemoryEngine::new());

    let source = FileMasterKeySource::new(&config.master_key_path);
    let provider = Arc::new(LocalKeyProvider::from_source(&source).context("loading master key")?);
    let vault = Arc::new(KeyVault::open(engine.collection(&config.key_vault_namespace)?, provider)?);

    let schema = Arc::new(employee_schema()?);
    let provisioner = EncryptedCollectionProvisioner::new(engine.clone(), vault.clone());
    if let ProvisionOutcome::Created(descriptor) = provisioner.setup(&schema, config)? {
        for entry in &descriptor.fields {
            info!(path = %entry.path, alias = %entry.key_alt_name, "field bound to data key");
        }
    }

    let employees = EncryptedCollection::open(engine.as_ref(), schema, vault)?;
    for doc in seed_documents() {
        employees.insert_one(doc)?;
    }
    info!(count = SEED.len(), "seeded employees");

    let raw = engine.collection(EMPLOYEES)?.find_one(&StorageQuery::all())?;
    if let Some(raw) = raw {
        println!("Stored form of one employee:\n{}", serde_json::to_string_pretty(&raw)?);
    }

    report("name = \"Alice Johnson\"", &employees.find(&Predicate::eq("name", "Alice Johnson"))?);
    report(
        "ssn = \"103-13-1333\"",
        &employees.find(&Predicate::eq("ssn", "103-13-1333"))?,
    );
    report(
        "salary between 100000 and 200000",
        &employees.find(&Predicate::between("salary", 100_000, 200_000))?,
    );
    report("salary >= 200000", &employees.find(&Predicate::at_least("salary", 200_000))?);
    report(
        "department = \"Engineering\" and salary <= 130000",
        &employees.find(
            &Predicate::eq("department", "Engineering").and(Predicate::at_most("salary", 130_000)),
        )?,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_employee_schema_is_valid() {
        let schema = employee_schema().unwrap();
        let descriptor = schema.provisioning_descriptor();
        assert_eq!(descriptor.paths().collect::<Vec<_>>(), vec!["name", "ssn", "salary"]);
    }

    #[test]
    fn test_seed_documents() {
        let docs = seed_documents();
        assert_eq!(docs.len(), 10);
        assert_eq!(docs[3]["ssn"], "103-13-1333");
        assert_eq!(docs[0]["company"], "MongoDB");
    }

    #[test]
    fn test_run_with_fresh_key() {
        let dir = TempDir::new().unwrap();
        let config = EncryptionConfig {
            master_key_path: dir.path().join("master.txt"),
            drop_collections: true,
            ..EncryptionConfig::default()
        };
        run(&config).unwrap();
        assert!(config.master_key_path.exists());
        run(&config).unwrap();
    }
}
