use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [Ready, Extracted, Cleaned, Split, ParentsPersisted, Upserted, Finalized, Failed],
    events {
        extract { transition: { from: Ready, to: Extracted } }
        clean { transition: { from: Extracted, to: Cleaned } }
        split { transition: { from: Cleaned, to: Split } }
        persist_parents { transition: { from: Split, to: ParentsPersisted } }
        upsert { transition: { from: ParentsPersisted, to: Upserted } }
        finalize { transition: { from: Upserted, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Extracted, to: Failed }
            transition: { from: Cleaned, to: Failed }
            transition: { from: Split, to: Failed }
            transition: { from: ParentsPersisted, to: Failed }
            transition: { from: Upserted, to: Failed }
            transition: { from: Finalized, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
