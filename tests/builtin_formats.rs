//! Built-in catalog: every format resolves and every sheet renders.

use chrono::NaiveDate;
use extraction::builtin;
use extraction::prelude::*;
use pretty_assertions::assert_eq;

fn registry() -> FormatRegistry {
    builtin::registry().unwrap()
}

fn render(registry: &FormatRegistry, format: &str, version: &str, sheet: &str) -> CompiledQuery {
    Planner::new(registry, builtin::templates())
        .render_step(&ExtractionContext::new(7), &FormatKey::new(format, version), sheet)
        .unwrap()
}

#[test]
fn test_every_sheet_of_every_format_renders() {
    let registry = registry();
    let planner = Planner::new(&registry, builtin::templates());
    let ctx = ExtractionContext::new(1);
    for key in registry.keys() {
        let format = registry.format(key).unwrap();
        for sheet in format.sheet_names() {
            let compiled = planner
                .render_step(&ctx, key, sheet)
                .unwrap_or_else(|e| panic!("{} {}: {}", key, sheet, e));
            assert!(compiled.sql.trim_start().starts_with("SELECT"), "{} {}", key, sheet);
            assert!(!compiled.sql.contains("[["), "{} {}", key, sheet);
            assert!(!compiled.sql.contains('&'), "{} {}", key, sheet);
        }
    }
}

#[test]
fn test_rjb_delegates_to_rdb() {
    let registry = registry();
    let rjb = FormatKey::new("RJB", "1.0");

    let station = registry.resolve(&rjb, "createStationTable").unwrap();
    assert_eq!(station.path, "rdb/v1_3/createStationTable");
    assert_eq!(station.declared_by, FormatKey::new("RDB", "1.3"));

    let injection = registry.resolve(&rjb, "injectionTripTable").unwrap();
    assert_eq!(injection.path, "rjb/v1_0/injectionTripTable");
    assert_eq!(injection.declared_by, rjb);
}

#[test]
fn test_upstream_tables_are_bound() {
    let registry = registry();
    let station = render(&registry, "RDB", "1.3", "HH");
    assert!(station.sql.contains("INNER JOIN ext_tr_7 T"));
    let lengths = render(&registry, "RDB", "1.3", "HL");
    assert!(lengths.sql.contains("FROM ext_sl_7 SL"));
}

#[test]
fn test_cost_station_sheet() {
    let registry = registry();
    let station = render(&registry, "COST", "1.4", "HH");

    assert!(!station.sql.contains("station_time"));
    let injected = station.sql.find("O.fishing_validity AS fishing_validity").unwrap();
    assert!(injected > station.sql.find("G.mesh_size AS mesh_size").unwrap());
    assert!(injected < station.sql.find("G.selection_device").unwrap());
    assert_eq!(station.hidden_columns, vec!["station_time"]);

    let lengths = render(&registry, "COST", "1.4", "HL");
    assert!(
        lengths.sql.find("AS length_code").unwrap() < lengths.sql.find("AS length_class").unwrap()
    );
}

#[test]
fn test_free1_hides_groups() {
    let registry = registry();
    let trip = render(&registry, "FREE1", "1.0", "TR");
    assert_eq!(trip.hidden_columns, vec!["landing_country", "project"]);

    let species = render(&registry, "FREE1", "1.0", "SL");
    assert_eq!(species.hidden_columns, vec!["sex"]);
    assert!(species.has_distinct);
    assert!(species.sql.starts_with("SELECT DISTINCT"));
}

#[test]
fn test_free2_overrides_trip_sheet_only() {
    let registry = registry();
    let trip = render(&registry, "FREE2", "1.9", "TR");
    assert!(trip.sql.contains("'MAREE' AS record_type"));
    let station = render(&registry, "FREE2", "1.9", "HH");
    assert_eq!(station.template, "rdb/v1_3/createStationTable");
}

#[test]
fn test_pmfm_injections_use_their_own_binds() {
    let registry = registry();
    let trip = render(&registry, "PMFM_TRIP", "1.0", "TR");
    assert!(trip.sql.contains("TM.pmfm_label = 'SEA_STATE') AS sea_state,"));
    assert!(trip.sql.contains("TM.pmfm_label = 'WIND_FORCE') AS wind_force,"));
    assert!(
        trip.sql.find("AS vessel_identifier").unwrap() < trip.sql.find("AS sea_state").unwrap()
    );
}

#[test]
fn test_survival_test_sheets() {
    let registry = registry();
    let station = render(&registry, "SURVIVAL_TEST", "1.0", "HH");
    assert!(station.sql.contains("O.sea_state AS sea_state"));
    let release = render(&registry, "SURVIVAL_TEST", "1.0", "RL");
    assert!(release.sql.contains("FROM ext_hh_7 S"));
}

#[test]
fn test_trip_filter_enables_filter_groups() {
    let registry = registry();
    let planner = Planner::new(&registry, builtin::templates()).with_trip_filter(TripFilter {
        program_label: Some("SIH-OBSMER".to_string()),
        start_date: NaiveDate::from_ymd_opt(2023, 1, 1),
        end_date: NaiveDate::from_ymd_opt(2023, 6, 30),
        vessel_ids: vec![10, 11],
        ..TripFilter::default()
    });
    let trip = planner
        .render_step(&ExtractionContext::new(1), &FormatKey::new("RDB", "1.3"), "TR")
        .unwrap();

    assert!(trip.sql.contains("AND P.label = 'SIH-OBSMER'"));
    assert!(trip.sql.contains("AND T.return_date_time >= '2023-01-01'"));
    assert!(trip.sql.contains("AND T.return_date_time < '2023-07-01'"));
    assert!(trip.sql.contains("AND T.vessel_fk IN (10,11)"));
    assert!(!trip.sql.contains("T.id IN"));
    assert!(!trip.sql.contains("recorder_department_fk ="));
}
