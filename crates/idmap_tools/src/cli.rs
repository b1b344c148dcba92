#![forbid(unsafe_code)]

use idmap_contracts::mapping::{
    BatchLabel, IdentityId, MappingKind, MappingRecordInput, NonAssociationKey, PairSequence,
    PrimaryKey,
};
use idmap_os::clock::MappingClock;
use idmap_os::service::MappingService;
use idmap_storage::repo::NonAssociationStore;
use serde::Serialize;

pub const NON_ASSOCIATION_TABLE: &str = "non_association_mappings";

pub const USAGE: &str = "usage: idmap <create|get|get-key|delete|merge|update-list|set-seq|common|batch|latest|audit> [args]";

/// Runs one operator command against the non-association table and renders the outcome
/// as a JSON document.
pub fn execute_idmap_command<S, C>(
    service: &MappingService<NonAssociationKey, S, C>,
    subcommand: &str,
    args: &[String],
) -> Result<String, String>
where
    S: NonAssociationStore,
    C: MappingClock,
{
    match subcommand {
        "create" => {
            if args.len() < 5 || args.len() > 6 {
                return Err(
                    "usage: idmap create <primary> <first> <second> <sequence> <kind> [batch_label]"
                        .to_string(),
                );
            }
            let kind = MappingKind::parse(&args[4]).ok_or_else(|| {
                format!(
                    "unknown mapping kind '{}'. expected one of: LEGACY_CREATED, SERVICE_CREATED, MIGRATION_CREATED",
                    args[4]
                )
            })?;
            let batch_label = match args.get(5) {
                Some(raw) => Some(BatchLabel::new(raw.as_str()).map_err(|e| e.to_string())?),
                None => None,
            };
            let input = MappingRecordInput::v1(
                parse_primary(&args[0])?,
                parse_key(&args[1], &args[2], &args[3])?,
                kind,
                batch_label,
            )
            .map_err(|e| e.to_string())?;
            render(&service.create(input).map_err(|e| e.to_string())?)
        }
        "get" => {
            let [primary] = expect_args::<1>(args, "usage: idmap get <primary>")?;
            render(
                &service
                    .get_by_primary(&parse_primary(primary)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "get-key" => {
            let [first, second, sequence] =
                expect_args::<3>(args, "usage: idmap get-key <first> <second> <sequence>")?;
            render(
                &service
                    .get_by_secondary(&parse_key(first, second, sequence)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "delete" => {
            let [primary] = expect_args::<1>(args, "usage: idmap delete <primary>")?;
            render(
                &service
                    .delete(&parse_primary(primary)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "merge" => {
            let [old, new] = expect_args::<2>(args, "usage: idmap merge <old> <new>")?;
            render(
                &service
                    .merge_identity(&parse_identity(old)?, &parse_identity(new)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "update-list" => {
            if args.len() < 2 {
                return Err("usage: idmap update-list <old> <new> [excluded ...]".to_string());
            }
            let excluded = args[2..]
                .iter()
                .map(|raw| parse_identity(raw))
                .collect::<Result<Vec<_>, _>>()?;
            render(
                &service
                    .update_list(
                        &parse_identity(&args[0])?,
                        &parse_identity(&args[1])?,
                        &excluded,
                    )
                    .map_err(|e| e.to_string())?,
            )
        }
        "set-seq" => {
            let [primary, sequence] =
                expect_args::<2>(args, "usage: idmap set-seq <primary> <sequence>")?;
            render(
                &service
                    .set_sequence(&parse_primary(primary)?, parse_sequence(sequence)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "common" => {
            let [a, b] = expect_args::<2>(args, "usage: idmap common <a> <b>")?;
            render(
                &service
                    .find_common(&parse_identity(a)?, &parse_identity(b)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "batch" => {
            let [label] = expect_args::<1>(args, "usage: idmap batch <label>")?;
            render(
                &service
                    .records_in_batch(&parse_label(label)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "latest" => {
            let [label] = expect_args::<1>(args, "usage: idmap latest <label>")?;
            render(
                &service
                    .latest_migrated(&parse_label(label)?)
                    .map_err(|e| e.to_string())?,
            )
        }
        "audit" => {
            let events = match args {
                [] => service.audit().events(),
                [primary] => service.audit().events_for_primary(&parse_primary(primary)?),
                _ => return Err("usage: idmap audit [primary]".to_string()),
            };
            render(&events.map_err(|e| e.to_string())?)
        }
        _ => Err(format!("unknown idmap command: {subcommand}. {USAGE}")),
    }
}

fn expect_args<'a, const N: usize>(
    args: &'a [String],
    usage: &str,
) -> Result<[&'a String; N], String> {
    if args.len() != N {
        return Err(usage.to_string());
    }
    Ok(std::array::from_fn(|i| &args[i]))
}

fn render<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("failed to render output: {e}"))
}

fn parse_primary(raw: &str) -> Result<PrimaryKey, String> {
    PrimaryKey::parse(raw).map_err(|e| e.to_string())
}

fn parse_identity(raw: &str) -> Result<IdentityId, String> {
    IdentityId::new(raw.trim()).map_err(|e| e.to_string())
}

fn parse_label(raw: &str) -> Result<BatchLabel, String> {
    BatchLabel::new(raw.trim()).map_err(|e| e.to_string())
}

fn parse_sequence(raw: &str) -> Result<PairSequence, String> {
    raw.trim()
        .parse::<u32>()
        .map(PairSequence)
        .map_err(|_| format!("sequence must be a non-negative integer, got '{raw}'"))
}

fn parse_key(first: &str, second: &str, sequence: &str) -> Result<NonAssociationKey, String> {
    NonAssociationKey::new(
        parse_identity(first)?,
        parse_identity(second)?,
        parse_sequence(sequence)?,
    )
    .map_err(|e| e.to_string())
}
