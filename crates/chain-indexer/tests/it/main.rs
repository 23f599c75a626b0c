mod indexer;
