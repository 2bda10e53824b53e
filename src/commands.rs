fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod read {
    use crate::{acquire, connection, output};

    /// Read the state of the unit once and print it.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        acquire: acquire::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not establish a connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not acquire the state of the device")]
        Acquire(#[source] acquire::Error),
        #[error("could not output the snapshot")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let snapshot = runtime.block_on(async {
            let mut connection =
                connection::Connection::new(args.connection).await.map_err(Error::Connect)?;
            acquire::acquire(&mut connection, args.acquire.request_delay(), &args.acquire.decoder())
                .await
                .map_err(Error::Acquire)
        })?;

        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Category", "Field", "Value"]).map_err(Error::Output)?;
        for (category, field, value) in snapshot.entries() {
            output
                .result(
                    || vec![category.to_string(), field.to_string(), value.to_string()],
                    || serde_json::json!({ "category": category, "field": field, "value": value }),
                )
                .map_err(Error::Output)?;
        }
        output.document(|| snapshot.to_pretty_json()).map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }
}

pub mod publish {
    use crate::{acquire, connection, mqtt};
    use tracing::info;

    /// Read the state of the unit once and publish every value to an MQTT broker.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        acquire: acquire::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not establish a connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not acquire the state of the device")]
        Acquire(#[source] acquire::Error),
        #[error("could not publish the snapshot")]
        Publish(#[source] mqtt::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async {
            let mut connection =
                connection::Connection::new(args.connection).await.map_err(Error::Connect)?;
            let snapshot = acquire::acquire(
                &mut connection,
                args.acquire.request_delay(),
                &args.acquire.decoder(),
            )
            .await
            .map_err(Error::Acquire)?;
            // The device is no longer needed once the snapshot is complete.
            drop(connection);
            let messages = snapshot.messages(args.mqtt.topic());
            mqtt::publish(&args.mqtt, &messages).await.map_err(Error::Publish)?;
            info!(message = "published", count = messages.len());
            Ok::<_, Error>(())
        })
    }
}

pub mod registers {
    use crate::output;
    use crate::registers::{Block, Category, FIELDS, Field, Rule};

    /// Search and output the register map.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list the fields whose name, category, block or address contain this string.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register map")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct FieldSchema {
        pub block: Block,
        pub offset: u16,
        pub address: u16,
        pub registers: u16,
        pub category: Category,
        pub field: &'static str,
        pub rule: Rule,
    }

    impl FieldSchema {
        pub fn all_fields() -> impl Iterator<Item = Self> {
            FIELDS.iter().map(Self::from)
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            if self.field.contains(&pattern) {
                return true;
            }
            if <&str>::from(self.category).contains(&pattern) {
                return true;
            }
            if <&str>::from(self.block).contains(&pattern) {
                return true;
            }
            self.address.to_string().contains(&pattern)
        }
    }

    impl From<&Field> for FieldSchema {
        fn from(field: &Field) -> Self {
            Self {
                block: field.block,
                offset: field.offset,
                address: field.address(),
                registers: field.len,
                category: field.category,
                field: field.name,
                rule: field.rule,
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let fields = FieldSchema::all_fields()
            .filter(|f| args.filter.as_deref().is_none_or(|p| f.is_match(p)))
            .collect::<Vec<_>>();
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Block",
                "Offset",
                "Address",
                "Registers",
                "Category",
                "Field",
                "Rule",
            ])
            .map_err(Error::Output)?;
        for field in &fields {
            output
                .result(
                    || {
                        vec![
                            field.block.to_string(),
                            field.offset.to_string(),
                            field.address.to_string(),
                            field.registers.to_string(),
                            field.category.to_string(),
                            field.field.to_string(),
                            field.rule.to_string(),
                        ]
                    },
                    || field,
                )
                .map_err(Error::Output)?;
        }
        output.document(|| serde_json::to_string_pretty(&fields)).map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }

}
