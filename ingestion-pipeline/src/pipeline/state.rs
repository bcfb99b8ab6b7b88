use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [
        Ready,
        EntitiesLoaded,
        EntitiesExtracted,
        EntitiesResolved,
        FactsExtracted,
        FactsLoaded,
        FactsResolved,
        Temporalized,
        Committed,
        Failed
    ],
    events {
        load_existing_entities { transition: { from: Ready, to: EntitiesLoaded } }
        extract_entities { transition: { from: EntitiesLoaded, to: EntitiesExtracted } }
        resolve_entities { transition: { from: EntitiesExtracted, to: EntitiesResolved } }
        extract_facts { transition: { from: EntitiesResolved, to: FactsExtracted } }
        load_existing_facts { transition: { from: FactsExtracted, to: FactsLoaded } }
        resolve_facts { transition: { from: FactsLoaded, to: FactsResolved } }
        extract_temporal { transition: { from: FactsResolved, to: Temporalized } }
        commit { transition: { from: Temporalized, to: Committed } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: EntitiesLoaded, to: Failed }
            transition: { from: EntitiesExtracted, to: Failed }
            transition: { from: EntitiesResolved, to: Failed }
            transition: { from: FactsExtracted, to: Failed }
            transition: { from: FactsLoaded, to: Failed }
            transition: { from: FactsResolved, to: Failed }
            transition: { from: Temporalized, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
