use chrono::Utc;
use ethers::types::{Address, Bytes, Signature, H256, U256};
use pisa::appointment::{Appointment, Status, StoredAppointment};
use pisa::store::{Options, PutOutcome, Store};

fn sample(job_id: u64) -> StoredAppointment {
    StoredAppointment {
        appointment: Appointment {
            contract_address: Address::repeat_byte(0x11),
            customer_address: Address::repeat_byte(0x22),
            start_block: 100,
            end_block: 200,
            challenge_period: 10,
            customer_chosen_id: U256::from(7),
            job_id,
            data: Bytes::from_static(b"\xde\xad"),
            refund: U256::from(1),
            gas_limit: 21_000,
            mode: 0,
            event_abi: "Dispute(address)".to_string(),
            event_args: Bytes::default(),
            pre_condition: Bytes::default(),
            post_condition: Bytes::default(),
            payment_hash: H256::zero(),
            customer_signature: Signature {
                r: U256::zero(),
                s: U256::zero(),
                v: 27,
            },
        },
        signature: Signature {
            r: U256::zero(),
            s: U256::zero(),
            v: 27,
        },
        status: Status::Active,
        received_at: Utc::now(),
    }
}

/// Runs the store against a real Postgres instance rather than the
/// `sqlite::memory:` used by the unit tests, since `sqlx::Any`'s query
/// translation is the one part of the store that can't be trusted to
/// behave the same across drivers.
#[tokio::test]
async fn put_and_replace_round_trip_against_postgres() -> anyhow::Result<()> {
    let container = postgres_docker_utils::setup().await?;
    let database_url = format!(
        "postgres://postgres@localhost:{}/pisa",
        container.port()
    );

    let options = Options {
        database: database_url.parse()?,
        database_migrate: true,
        database_max_connections: 5,
    };
    let store = Store::new(&options).await?;

    let first = sample(1);
    let outcome = store.put(&first).await?;
    assert_eq!(outcome, PutOutcome::Inserted);

    let second = sample(2);
    let outcome = store.put(&second).await?;
    assert!(matches!(outcome, PutOutcome::Replaced(_)));

    assert!(store.get(&first.appointment.id()).await?.is_none());
    let fetched = store.get(&second.appointment.id()).await?.unwrap();
    assert_eq!(fetched.appointment, second.appointment);

    store.set_last_block(123).await?;
    assert_eq!(store.get_last_block().await?, Some(123));

    Ok(())
}
